use std::sync::Arc;

use async_trait::async_trait;
use suite_runner::logging::SharedLogControl;
use suite_runner::prefs::MemoryPrefs;
use suite_runner::{
    progress_channel, ExecReport, ExecRequest, LocalDeviceRegistry, RunConfig, SuiteError,
    SuiteEvent, SuiteRunner, TestExecutor,
};

/// Stand-in harness that reports a clean pass for every phase.
struct EchoExecutor;

#[async_trait]
impl TestExecutor for EchoExecutor {
    async fn run(&self, request: &ExecRequest) -> Result<ExecReport, SuiteError> {
        println!("  would launch harness with filter '{}'", request.filter);
        Ok(ExecReport {
            ok: true,
            tests: 12,
            failures: 0,
            unimplemented: 0,
            skipped: 1,
        })
    }
}

#[tokio::main]
async fn main() {
    let prefs = Arc::new(MemoryPrefs::new());
    let log = Arc::new(SharedLogControl::default());
    let registry = Arc::new(LocalDeviceRegistry::new(
        std::env::temp_dir().join("spindle-example-builds"),
    ));
    let (tx, mut rx) = progress_channel();

    let runner = SuiteRunner::new(prefs, log, registry, Arc::new(EchoExecutor)).with_progress(tx);

    let config = RunConfig::default()
        .with_backends(vec!["interp".to_string()])
        .with_standalone("c-standalone");

    println!("Running the test matrix...\n");
    let report = runner.run(&config).await.expect("run failed");
    drop(runner);

    println!("\nPhases:");
    while let Ok(event) = rx.try_recv() {
        if let SuiteEvent::PhaseCompleted {
            label,
            passed,
            duration,
        } = event
        {
            let icon = if passed { "✓" } else { "✗" };
            println!("  {} {} ({:?})", icon, label, duration);
        }
    }

    println!("\n{}", report.summary());
}
