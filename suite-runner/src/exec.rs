// Harness execution
// Launches the external test harness and reads back its machine readable report.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::classify::UnimplementedPolicy;
use crate::error::SuiteError;
use crate::prefs::PrefValue;

/// Marker prefix for the report line a harness writes to stdout.
pub const REPORT_PREFIX: &str = "##spindle[report]";

/// Environment variable names understood by harness workers.
pub mod env {
    /// Policy for unimplemented backend features, `fail` or `skip`.
    pub const UNIMPLEMENTED: &str = "SPINDLE_UNIMPLEMENTED";
    /// Zero-based shard index of this worker.
    pub const SHARD_INDEX: &str = "SPINDLE_SHARD_INDEX";
    /// Total number of shards in the phase.
    pub const SHARD_COUNT: &str = "SPINDLE_SHARD_COUNT";
    /// Prefix for preference overrides.
    pub const PREF_PREFIX: &str = "SPINDLE_PREF_";
    /// Name of the active device.
    pub const DEVICE: &str = "SPINDLE_DEVICE";
    /// Build directory of the active standalone device.
    pub const DEVICE_DIR: &str = "SPINDLE_DEVICE_DIR";
    /// Whether the active device builds at the first run statement.
    pub const BUILD_ON_RUN: &str = "SPINDLE_BUILD_ON_RUN";
    /// Whether device builds show compiler output.
    pub const WITH_OUTPUT: &str = "SPINDLE_WITH_OUTPUT";
    /// JSON encoded build options for the active device.
    pub const BUILD_OPTIONS: &str = "SPINDLE_BUILD_OPTIONS";
}

/// A single harness invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Directories to collect tests from.
    pub directories: Vec<PathBuf>,
    /// Tag filter expression; empty selects everything.
    pub filter: String,
    /// How unimplemented-feature errors are classified.
    pub policy: UnimplementedPolicy,
    /// Preference overrides applied inside the worker.
    pub preferences: BTreeMap<String, PrefValue>,
    /// Extra environment, typically the active device description.
    pub env: HashMap<String, String>,
    /// Also collect documentation examples.
    pub doc_examples: bool,
    /// Shard assignment as (index, count) when part of a worker pool.
    pub shard: Option<(usize, usize)>,
    /// Wall clock budget for the process.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(directories: Vec<PathBuf>, filter: String, policy: UnimplementedPolicy) -> Self {
        Self {
            directories,
            filter,
            policy,
            preferences: BTreeMap::new(),
            env: HashMap::new(),
            doc_examples: false,
            shard: None,
            timeout: None,
        }
    }

    pub fn with_preferences(mut self, preferences: BTreeMap<String, PrefValue>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_doc_examples(mut self, doc_examples: bool) -> Self {
        self.doc_examples = doc_examples;
        self
    }

    pub fn sharded(mut self, index: usize, count: usize) -> Self {
        self.shard = Some((index, count));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Aggregated result of one harness invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecReport {
    /// Whether the harness completed its collection and run.
    pub ok: bool,
    /// Number of tests executed.
    #[serde(default)]
    pub tests: u64,
    /// Hard failures, not counting unimplemented features.
    #[serde(default)]
    pub failures: u64,
    /// Tests that hit an unimplemented backend feature.
    #[serde(default)]
    pub unimplemented: u64,
    /// Tests skipped by filters or markers.
    #[serde(default)]
    pub skipped: u64,
}

impl ExecReport {
    /// Verdict under the given classification policy.
    pub fn passed_under(&self, policy: UnimplementedPolicy) -> bool {
        if !self.ok || self.failures > 0 {
            return false;
        }
        !(policy.is_strict() && self.unimplemented > 0)
    }

    /// Folds a shard report into this one.
    pub fn merge(&mut self, other: &ExecReport) {
        self.ok = self.ok && other.ok;
        self.tests += other.tests;
        self.failures += other.failures;
        self.unimplemented += other.unimplemented;
        self.skipped += other.skipped;
    }
}

/// Encodes preference overrides as environment variables.
///
/// `codegen.cc.extra_flags` becomes `SPINDLE_PREF_CODEGEN_CC_EXTRA_FLAGS`.
pub fn preference_env(preferences: &BTreeMap<String, PrefValue>) -> Vec<(String, String)> {
    preferences
        .iter()
        .map(|(key, value)| {
            let mut name = String::with_capacity(env::PREF_PREFIX.len() + key.len());
            name.push_str(env::PREF_PREFIX);
            for ch in key.chars() {
                if ch.is_ascii_alphanumeric() {
                    name.push(ch.to_ascii_uppercase());
                } else {
                    name.push('_');
                }
            }
            (name, value.to_string())
        })
        .collect()
}

/// Runs a single harness invocation to completion.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn run(&self, request: &ExecRequest) -> Result<ExecReport, SuiteError>;
}

/// Executor that launches the harness as an operating system process.
///
/// The harness receives the test directories and filter as arguments and the
/// rest of the request through the environment. It must write a single
/// `##spindle[report]{...}` line to stdout before exiting; remaining stdout
/// and all stderr pass straight through as diagnostics.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            command: vec!["spindle-harness".to_string()],
            working_dir: None,
        }
    }
}

impl ProcessExecutor {
    /// Uses `command` as the harness executable and leading arguments.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = Some(working_dir);
        self
    }

    fn build_command(&self, request: &ExecRequest) -> Result<Command, SuiteError> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| SuiteError::Config("empty harness command".to_string()))?;

        let mut command = Command::new(program);
        command.args(leading);
        for directory in &request.directories {
            command.arg(directory);
        }
        if !request.filter.is_empty() {
            command.arg("--filter").arg(&request.filter);
        }
        if request.doc_examples {
            command.arg("--doc-examples");
        }
        if let Some(working_dir) = &self.working_dir {
            command.current_dir(working_dir);
        }

        command.env(env::UNIMPLEMENTED, request.policy.env_value());
        if let Some((index, count)) = request.shard {
            command.env(env::SHARD_INDEX, index.to_string());
            command.env(env::SHARD_COUNT, count.to_string());
        }
        for (name, value) in preference_env(&request.preferences) {
            command.env(name, value);
        }
        command.envs(&request.env);

        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());
        command.stdin(Stdio::null());
        command.kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl TestExecutor for ProcessExecutor {
    async fn run(&self, request: &ExecRequest) -> Result<ExecReport, SuiteError> {
        let mut command = self.build_command(request)?;
        let mut child = command.spawn().map_err(SuiteError::Launch)?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SuiteError::Report("harness stdout was not captured".to_string())
        })?;

        let reader = tokio::spawn(async move {
            let mut report = None;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(payload) = line.strip_prefix(REPORT_PREFIX) {
                    report = Some(
                        serde_json::from_str::<ExecReport>(payload)
                            .map_err(|err| SuiteError::Report(err.to_string()))?,
                    );
                } else {
                    eprintln!("{}", line);
                }
            }
            Ok::<Option<ExecReport>, SuiteError>(report)
        });

        let status = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.kill().await;
                    reader.abort();
                    return Err(SuiteError::Timeout(limit));
                }
            },
            None => child.wait().await?,
        };

        let report = reader
            .await
            .map_err(|err| SuiteError::WorkerPanic(err.to_string()))??;

        match report {
            Some(report) => Ok(report),
            None => {
                if status.success() {
                    Err(SuiteError::Report(
                        "harness exited without a report".to_string(),
                    ))
                } else {
                    Err(SuiteError::Crashed(format!(
                        "exited with {} before reporting",
                        status
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request() -> ExecRequest {
        ExecRequest::new(Vec::new(), String::new(), UnimplementedPolicy::Strict)
    }

    fn shell_executor(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    #[test]
    fn preference_names_are_upper_snake_case() {
        let mut preferences = BTreeMap::new();
        preferences.insert(
            "devices.c-standalone.openmp_threads".to_string(),
            PrefValue::Int(4),
        );
        let variables = preference_env(&preferences);
        assert_eq!(
            variables,
            vec![(
                "SPINDLE_PREF_DEVICES_C_STANDALONE_OPENMP_THREADS".to_string(),
                "4".to_string()
            )]
        );
    }

    #[test]
    fn strict_policy_fails_on_unimplemented() {
        let report = ExecReport {
            ok: true,
            tests: 10,
            failures: 0,
            unimplemented: 1,
            skipped: 0,
        };
        assert!(!report.passed_under(UnimplementedPolicy::Strict));
        assert!(report.passed_under(UnimplementedPolicy::Lenient));
    }

    #[test]
    fn hard_failures_fail_under_any_policy() {
        let report = ExecReport {
            ok: true,
            tests: 10,
            failures: 2,
            unimplemented: 0,
            skipped: 0,
        };
        assert!(!report.passed_under(UnimplementedPolicy::Lenient));
    }

    #[test]
    fn merge_folds_counts_and_ands_completion() {
        let mut merged = ExecReport {
            ok: true,
            ..ExecReport::default()
        };
        merged.merge(&ExecReport {
            ok: true,
            tests: 4,
            failures: 1,
            unimplemented: 0,
            skipped: 2,
        });
        merged.merge(&ExecReport {
            ok: false,
            tests: 3,
            failures: 0,
            unimplemented: 1,
            skipped: 0,
        });
        assert!(!merged.ok);
        assert_eq!(merged.tests, 7);
        assert_eq!(merged.failures, 1);
        assert_eq!(merged.unimplemented, 1);
        assert_eq!(merged.skipped, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn report_line_is_parsed_from_stdout() {
        let executor = shell_executor(
            r#"echo 'collecting tests'; echo '##spindle[report]{"ok":true,"tests":3,"failures":0,"unimplemented":0,"skipped":1}'"#,
        );
        let report = executor.run(&make_request()).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.tests, 3);
        assert_eq!(report.skipped, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_exit_with_report_still_returns_the_report() {
        let executor = shell_executor(
            r#"echo '##spindle[report]{"ok":true,"tests":5,"failures":2,"unimplemented":0,"skipped":0}'; exit 1"#,
        );
        let report = executor.run(&make_request()).await.unwrap();
        assert_eq!(report.failures, 2);
        assert!(!report.passed_under(UnimplementedPolicy::Strict));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_without_report_is_an_error() {
        let executor = shell_executor("exit 3");
        let err = executor.run(&make_request()).await.unwrap_err();
        assert!(matches!(err, SuiteError::Crashed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_without_report_is_a_protocol_error() {
        let executor = shell_executor("true");
        let err = executor.run(&make_request()).await.unwrap_err();
        assert!(matches!(err, SuiteError::Report(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_processes_are_killed_on_timeout() {
        let executor = shell_executor("sleep 30");
        let request = make_request().with_timeout(Duration::from_millis(100));
        let err = executor.run(&request).await.unwrap_err();
        assert!(matches!(err, SuiteError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_report_lines_are_rejected() {
        let executor = shell_executor("echo '##spindle[report]not json'");
        let err = executor.run(&make_request()).await.unwrap_err();
        assert!(matches!(err, SuiteError::Report(_)));
    }

    #[test]
    fn empty_harness_command_is_invalid() {
        let executor = ProcessExecutor::new(Vec::new());
        let err = executor.build_command(&make_request()).unwrap_err();
        assert!(matches!(err, SuiteError::Config(_)));
    }
}
