// Run configuration
// Options controlling which targets, phases and execution modes a run covers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::UnimplementedPolicy;
use crate::device::C_STANDALONE_DEVICE;
use crate::plan::{CC, CODEGEN_INDEPENDENT, INTERP};

/// Floating point width applied to state variables for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatPrecision {
    F32,
    F64,
}

impl FloatPrecision {
    /// Preference value stored under `core.float_precision`.
    pub fn pref_value(self) -> &'static str {
        match self {
            FloatPrecision::F32 => "float32",
            FloatPrecision::F64 => "float64",
        }
    }
}

impl fmt::Display for FloatPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pref_value())
    }
}

impl FromStr for FloatPrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" | "single" => Ok(FloatPrecision::F32),
            "f64" | "float64" | "double" => Ok(FloatPrecision::F64),
            other => Err(format!("unknown float precision '{}'", other)),
        }
    }
}

/// Which runtime code generation targets a run covers.
///
/// Accepts a single name or a list in configuration files; absent means
/// auto-detection against the installed toolchains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum TargetSelection {
    /// Every target whose toolchain is available on this machine.
    #[default]
    Auto,
    /// A single named target.
    Single(String),
    /// An explicit list of targets.
    Multiple(Vec<String>),
}

impl TargetSelection {
    /// The requested names, with a single name promoted to a one-element
    /// list. `None` means auto-detect.
    pub fn as_explicit(&self) -> Option<Vec<String>> {
        match self {
            TargetSelection::Auto => None,
            TargetSelection::Single(name) => Some(vec![name.clone()]),
            TargetSelection::Multiple(names) => Some(names.clone()),
        }
    }
}

/// Worker pool settings for phases that run with multiple processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Number of worker processes. Zero means one per available core.
    #[serde(default)]
    pub workers: usize,
    /// Wall clock budget for a single worker process, in seconds.
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,
    /// How many times a crashed or timed out worker is resubmitted.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_process_timeout() -> u64 {
    3600
}

fn default_max_restarts() -> u32 {
    2
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            process_timeout_secs: default_process_timeout(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl ParallelConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    /// Worker count with zero resolved to the number of available cores.
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        }
    }
}

/// Configuration for a whole test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Runtime code generation targets to test.
    #[serde(default)]
    pub backends: TargetSelection,
    /// Include tests tagged as long running.
    #[serde(default)]
    pub long_tests: bool,
    /// Run the codegen-independent phase.
    #[serde(default = "default_true")]
    pub test_codegen_independent: bool,
    /// Standalone device to test, if any.
    #[serde(default)]
    pub standalone: Option<String>,
    /// Add OpenMP variants of the standalone phases.
    #[serde(default)]
    pub test_openmp: bool,
    /// Targets allowed to use the worker pool.
    #[serde(default = "default_parallel_targets")]
    pub parallel_targets: Vec<String>,
    /// Reset preferences to their defaults for the run and restore the
    /// previous values afterwards.
    #[serde(default = "default_true")]
    pub reset_preferences: bool,
    /// Fail tests that hit unimplemented backend features instead of
    /// recording them as skips.
    #[serde(default = "default_true")]
    pub strict_unimplemented: bool,
    /// Extra options forwarded to standalone device builds.
    #[serde(default)]
    pub build_options: BTreeMap<String, String>,
    /// Additional directories searched for tests.
    #[serde(default)]
    pub extra_test_dirs: Vec<PathBuf>,
    /// Floating point width override for the run.
    #[serde(default)]
    pub float_precision: Option<FloatPrecision>,
    /// Collect documentation examples during the codegen-independent phase.
    #[serde(default = "default_true")]
    pub doc_examples: bool,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: ParallelConfig,
}

fn default_true() -> bool {
    true
}

fn default_parallel_targets() -> Vec<String> {
    vec![
        CODEGEN_INDEPENDENT.to_string(),
        INTERP.to_string(),
        CC.to_string(),
        C_STANDALONE_DEVICE.to_string(),
    ]
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backends: TargetSelection::Auto,
            long_tests: false,
            test_codegen_independent: true,
            standalone: None,
            test_openmp: false,
            parallel_targets: default_parallel_targets(),
            reset_preferences: true,
            strict_unimplemented: true,
            build_options: BTreeMap::new(),
            extra_test_dirs: Vec::new(),
            float_precision: None,
            doc_examples: true,
            pool: ParallelConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn with_backend(mut self, backend: &str) -> Self {
        self.backends = TargetSelection::Single(backend.to_string());
        self
    }

    pub fn with_backends(mut self, backends: Vec<String>) -> Self {
        self.backends = TargetSelection::Multiple(backends);
        self
    }

    pub fn with_standalone(mut self, device: &str) -> Self {
        self.standalone = Some(device.to_string());
        self
    }

    pub fn with_long_tests(mut self, long_tests: bool) -> Self {
        self.long_tests = long_tests;
        self
    }

    pub fn with_openmp(mut self, test_openmp: bool) -> Self {
        self.test_openmp = test_openmp;
        self
    }

    pub fn with_float_precision(mut self, precision: FloatPrecision) -> Self {
        self.float_precision = Some(precision);
        self
    }

    pub fn with_parallel_targets(mut self, targets: Vec<String>) -> Self {
        self.parallel_targets = targets;
        self
    }

    /// Classification policy derived from the strictness flag.
    pub fn policy(&self) -> UnimplementedPolicy {
        UnimplementedPolicy::from_flag(self.strict_unimplemented)
    }
}
