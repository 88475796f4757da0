use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use suite_runner::logging::SharedLogControl;
use suite_runner::prefs::MemoryPrefs;
use suite_runner::{
    progress_channel, FloatPrecision, LocalDeviceRegistry, ProcessExecutor, RunConfig,
    SuiteEvent, SuiteRunner,
};

/// Run the test matrix
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Test directories to collect from (default: current directory)
    pub directories: Vec<PathBuf>,

    /// Load run settings from a YAML file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Comma separated code generation targets (default: auto-detect)
    #[arg(long, value_name = "TARGETS", value_delimiter = ',')]
    pub targets: Option<Vec<String>>,

    /// Standalone device to test
    #[arg(long, value_name = "DEVICE")]
    pub standalone: Option<String>,

    /// Include tests tagged as long running
    #[arg(long)]
    pub long_tests: bool,

    /// Add OpenMP variants of the standalone phases
    #[arg(long)]
    pub openmp: bool,

    /// Skip the codegen-independent phase
    #[arg(long)]
    pub no_codegen_independent: bool,

    /// Record unimplemented backend features as skips instead of failures
    #[arg(long)]
    pub lenient: bool,

    /// Keep current preferences instead of resetting to defaults
    #[arg(long)]
    pub keep_preferences: bool,

    /// Floating point width: float32 or float64
    #[arg(long, value_name = "WIDTH")]
    pub float_precision: Option<String>,

    /// Number of worker processes (0 = one per core)
    #[arg(long, short = 'j', value_name = "N")]
    pub workers: Option<usize>,

    /// Comma separated targets allowed to use the worker pool
    #[arg(long, value_name = "TARGETS", value_delimiter = ',')]
    pub parallel_targets: Option<Vec<String>>,

    /// Skip doc-example collection during the codegen-independent phase
    #[arg(long)]
    pub no_doc_examples: bool,

    /// Wall clock budget for a single worker process, in seconds
    #[arg(long, value_name = "SECS")]
    pub process_timeout: Option<u64>,

    /// How many times a crashed or timed out worker is resubmitted
    #[arg(long, value_name = "N")]
    pub max_restarts: Option<u32>,

    /// Build option forwarded to standalone device builds (KEY=VALUE, repeatable)
    #[arg(long = "build-option", value_name = "KEY=VALUE")]
    pub build_options: Vec<String>,

    /// Harness command launched for each phase
    #[arg(long, value_name = "CMD", default_value = "spindle-harness")]
    pub harness: String,

    /// Build directory root for standalone devices
    #[arg(long, value_name = "DIR")]
    pub build_root: Option<PathBuf>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let mut config = build_config(&args)?;

    let harness: Vec<String> = args
        .harness
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if harness.is_empty() {
        color_eyre::eyre::bail!("Harness command is empty");
    }

    let mut directories = args.directories.clone();
    if directories.is_empty() {
        directories.push(PathBuf::from("."));
    }
    let test_root = directories.remove(0);
    config.extra_test_dirs.extend(directories);

    let registry = match &args.build_root {
        Some(root) => LocalDeviceRegistry::new(root.clone()),
        None => LocalDeviceRegistry::with_default_root(),
    };

    let prefs = Arc::new(MemoryPrefs::new());
    let log = Arc::new(SharedLogControl::default());
    let (tx, mut rx) = progress_channel();

    let runner = SuiteRunner::new(prefs, log, Arc::new(registry), Arc::new(ProcessExecutor::new(harness)))
        .with_test_root(test_root)
        .with_progress(tx);

    let run_config = config.clone();
    let runner_handle = tokio::spawn(async move { runner.run(&run_config).await });

    while let Some(event) = rx.recv().await {
        match event {
            SuiteEvent::RunStarted {
                targets,
                standalone,
                long_tests,
                ..
            } => {
                output::header(&format!("Testing targets {}", targets.join(", ")));
                if let Some(device) = standalone {
                    output::status("Standalone", &device);
                }
                if long_tests {
                    output::info("Including long tests");
                }
            }
            SuiteEvent::PhaseStarted {
                label,
                filter,
                parallel,
            } => {
                let mode = if parallel { " [parallel]" } else { "" };
                output::status("Running", &format!("{} ({}){}", label, filter, mode));
            }
            SuiteEvent::PhaseCompleted {
                label,
                passed,
                duration,
            } => {
                let line = format!("{} ({:.1}s)", label, duration.as_secs_f64());
                if passed {
                    output::success(&line);
                } else {
                    output::failure(&line);
                }
            }
            SuiteEvent::DeviceActivated {
                device,
                build_on_run,
            } => {
                if build_on_run {
                    output::dim(&format!("  device {} active", device));
                } else {
                    output::dim(&format!("  device {} active (deferred build)", device));
                }
            }
            SuiteEvent::DeviceReset { device } => {
                output::dim(&format!("  device {} reset", device));
            }
            SuiteEvent::CachesCleared { .. } => {}
            SuiteEvent::WorkerRestarted {
                shard,
                attempt,
                reason,
            } => {
                output::warning(&format!(
                    "worker {} restarted (attempt {}): {}",
                    shard, attempt, reason
                ));
            }
            SuiteEvent::WorkerFailed { shard, reason } => {
                output::failure(&format!("worker {} gave up: {}", shard, reason));
            }
            SuiteEvent::RunCompleted { passed, total, duration } => {
                output::header(&format!(
                    "{}/{} phase(s) passed in {:.1}s",
                    passed,
                    total,
                    duration.as_secs_f64()
                ));
            }
        }
    }

    let report = runner_handle.await??;
    if !report.success() {
        std::process::exit(1);
    }

    Ok(())
}

/// Loads the base configuration and layers every command line override on it.
fn build_config(args: &RunArgs) -> Result<RunConfig> {
    let mut config = load_config(args)?;

    if let Some(targets) = &args.targets {
        config = config.with_backends(targets.clone());
    }
    if let Some(standalone) = &args.standalone {
        config = config.with_standalone(standalone);
    }
    if args.long_tests {
        config = config.with_long_tests(true);
    }
    if args.openmp {
        config = config.with_openmp(true);
    }
    if args.no_codegen_independent {
        config.test_codegen_independent = false;
    }
    if args.lenient {
        config.strict_unimplemented = false;
    }
    if args.keep_preferences {
        config.reset_preferences = false;
    }
    if args.no_doc_examples {
        config.doc_examples = false;
    }
    if let Some(width) = &args.float_precision {
        let precision: FloatPrecision = width
            .parse()
            .map_err(|e: String| color_eyre::eyre::eyre!("{}", e))?;
        config = config.with_float_precision(precision);
    }
    if let Some(workers) = args.workers {
        config.pool.workers = workers;
    }
    if let Some(targets) = &args.parallel_targets {
        config = config.with_parallel_targets(targets.clone());
    }
    if let Some(secs) = args.process_timeout {
        config.pool.process_timeout_secs = secs;
    }
    if let Some(restarts) = args.max_restarts {
        config.pool.max_restarts = restarts;
    }
    for option in &args.build_options {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            color_eyre::eyre::eyre!("Invalid build option '{}', expected KEY=VALUE", option)
        })?;
        config
            .build_options
            .insert(key.to_string(), value.to_string());
    }

    Ok(config)
}

fn load_config(args: &RunArgs) -> Result<RunConfig> {
    match &args.config {
        Some(path) => {
            if !path.exists() {
                color_eyre::eyre::bail!("Config file not found: {}", path.display());
            }
            let content = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&content)?)
        }
        None => Ok(RunConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: RunArgs,
    }

    fn parse(argv: &[&str]) -> RunArgs {
        TestCli::try_parse_from(argv).unwrap().args
    }

    #[test]
    fn pool_and_build_flags_reach_the_config() {
        let args = parse(&[
            "spindle",
            "--parallel-targets",
            "interp,c-standalone",
            "--process-timeout",
            "120",
            "--max-restarts",
            "5",
            "--build-option",
            "cleanup=false",
            "--no-doc-examples",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.parallel_targets, vec!["interp", "c-standalone"]);
        assert_eq!(config.pool.process_timeout_secs, 120);
        assert_eq!(config.pool.max_restarts, 5);
        assert_eq!(
            config.build_options.get("cleanup"),
            Some(&"false".to_string())
        );
        assert!(!config.doc_examples);
    }

    #[test]
    fn malformed_build_options_are_rejected() {
        let args = parse(&["spindle", "--build-option", "cleanup"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("cleanup"));
    }

    #[test]
    fn mode_flags_flip_their_config_fields() {
        let args = parse(&[
            "spindle",
            "--standalone",
            "c-standalone",
            "--openmp",
            "--long-tests",
            "--lenient",
            "--keep-preferences",
            "--no-codegen-independent",
            "--float-precision",
            "float32",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.standalone.as_deref(), Some("c-standalone"));
        assert!(config.test_openmp);
        assert!(config.long_tests);
        assert!(!config.strict_unimplemented);
        assert!(!config.reset_preferences);
        assert!(!config.test_codegen_independent);
        assert_eq!(config.float_precision, Some(FloatPrecision::F32));
    }
}
