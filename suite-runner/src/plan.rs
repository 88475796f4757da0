// Target matrix planning
// Detects usable targets and validates the requested matrix before anything runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::RunConfig;
use crate::device::C_STANDALONE_DEVICE;
use crate::error::SuiteError;

/// Name of the interpreter target, always available.
pub const INTERP: &str = "interp";
/// Runtime target backed by the system C compiler.
pub const CC: &str = "cc";
/// Runtime target backed by the LLVM toolchain.
pub const LLVM: &str = "llvm";
/// Pseudo-target name for the codegen-independent phase.
pub const CODEGEN_INDEPENDENT: &str = "codegen-independent";

/// Probes whether a target's toolchain is present on this machine.
pub trait TargetProbe: Send + Sync {
    fn available(&self, target: &str) -> bool;
}

/// Probe that looks for the backing executables on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolchainProbe;

impl TargetProbe for ToolchainProbe {
    fn available(&self, target: &str) -> bool {
        match target {
            INTERP => true,
            CC => ["cc", "gcc", "clang"]
                .iter()
                .any(|exe| which::which(exe).is_ok()),
            LLVM => which::which("llvm-config").is_ok(),
            _ => false,
        }
    }
}

/// A target selected for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    /// Whether this target's phase may use the worker pool.
    pub parallel_safe: bool,
}

/// The resolved matrix for a run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Runtime targets, tested in order.
    pub targets: Vec<Target>,
    /// Standalone device under test, if any.
    pub standalone: Option<Target>,
    /// Whether the codegen-independent phase may use the worker pool.
    pub parallel_codegen_independent: bool,
    /// Whether OpenMP variants of the standalone phases run.
    pub openmp: bool,
}

impl RunPlan {
    /// Names of everything that will run with multiple processes.
    pub fn parallel_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if self.parallel_codegen_independent {
            names.push(CODEGEN_INDEPENDENT);
        }
        names.extend(
            self.targets
                .iter()
                .filter(|target| target.parallel_safe)
                .map(|target| target.name.as_str()),
        );
        if let Some(standalone) = &self.standalone {
            if standalone.parallel_safe {
                names.push(standalone.name.as_str());
            }
        }
        names
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|target| target.name.as_str()).collect()
    }
}

/// Resolves the target matrix from configuration and machine state.
#[derive(Clone)]
pub struct MatrixPlanner {
    probe: Arc<dyn TargetProbe>,
}

impl Default for MatrixPlanner {
    fn default() -> Self {
        Self {
            probe: Arc::new(ToolchainProbe),
        }
    }
}

impl MatrixPlanner {
    pub fn new(probe: Arc<dyn TargetProbe>) -> Self {
        Self { probe }
    }

    /// Resolves the matrix, validating the standalone request against
    /// `known_devices` before any state is touched.
    pub fn resolve(
        &self,
        config: &RunConfig,
        known_devices: &[String],
    ) -> Result<RunPlan, SuiteError> {
        // No worker pool on Windows.
        let parallel_enabled = !cfg!(windows);
        let requested: BTreeSet<&str> = config
            .parallel_targets
            .iter()
            .map(String::as_str)
            .collect();

        let selected: Vec<String> = match config.backends.as_explicit() {
            Some(backends) => backends,
            None => {
                let mut detected = vec![INTERP.to_string()];
                for candidate in [CC, LLVM] {
                    if self.probe.available(candidate) {
                        detected.push(candidate.to_string());
                    }
                }
                detected
            }
        };

        // Unique by name, keeping the requested order.
        let mut seen = BTreeSet::new();
        let targets = selected
            .into_iter()
            .filter(|name| seen.insert(name.clone()))
            .map(|name| {
                let parallel_safe = parallel_enabled && requested.contains(name.as_str());
                Target { name, parallel_safe }
            })
            .collect();

        let standalone = match &config.standalone {
            Some(name) => {
                if !known_devices.iter().any(|device| device == name) {
                    return Err(SuiteError::UnknownStandalone {
                        requested: name.clone(),
                        known: known_devices.join(", "),
                    });
                }
                Some(Target {
                    name: name.clone(),
                    parallel_safe: parallel_enabled && requested.contains(name.as_str()),
                })
            }
            None => None,
        };

        // The thread variants only exist for the c-standalone device; the
        // flag is ignored for anything else.
        let openmp = config.test_openmp
            && standalone
                .as_ref()
                .map(|target| target.name == C_STANDALONE_DEVICE)
                .unwrap_or(false);

        Ok(RunPlan {
            targets,
            standalone,
            parallel_codegen_independent: parallel_enabled
                && requested.contains(CODEGEN_INDEPENDENT),
            openmp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        available: Vec<&'static str>,
    }

    impl TargetProbe for FixedProbe {
        fn available(&self, target: &str) -> bool {
            self.available.contains(&target)
        }
    }

    fn make_planner(available: Vec<&'static str>) -> MatrixPlanner {
        MatrixPlanner::new(Arc::new(FixedProbe { available }))
    }

    fn known_devices() -> Vec<String> {
        vec!["runtime".to_string(), C_STANDALONE_DEVICE.to_string()]
    }

    #[test]
    fn auto_detection_keeps_the_interpreter_first() {
        let planner = make_planner(vec![LLVM]);
        let plan = planner
            .resolve(&RunConfig::default(), &known_devices())
            .unwrap();
        assert_eq!(plan.target_names(), vec![INTERP, LLVM]);
    }

    #[test]
    fn explicit_backends_skip_detection() {
        let planner = make_planner(vec![]);
        let config = RunConfig::default().with_backends(vec![CC.to_string()]);
        let plan = planner.resolve(&config, &known_devices()).unwrap();
        assert_eq!(plan.target_names(), vec![CC]);

        let single = RunConfig::default().with_backend(LLVM);
        let plan = planner.resolve(&single, &known_devices()).unwrap();
        assert_eq!(plan.target_names(), vec![LLVM]);
    }

    #[test]
    fn duplicate_backend_names_collapse() {
        let planner = make_planner(vec![]);
        let config =
            RunConfig::default().with_backends(vec![CC.to_string(), CC.to_string()]);
        let plan = planner.resolve(&config, &known_devices()).unwrap();
        assert_eq!(plan.target_names(), vec![CC]);
    }

    #[test]
    fn unknown_standalone_is_reported_with_alternatives() {
        let planner = make_planner(vec![]);
        let config = RunConfig::default().with_standalone("gpu");
        let err = planner.resolve(&config, &known_devices()).unwrap_err();
        match err {
            SuiteError::UnknownStandalone { requested, known } => {
                assert_eq!(requested, "gpu");
                assert!(known.contains("c-standalone"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn parallel_safety_is_the_intersection_with_the_allow_list() {
        let planner = make_planner(vec![CC]);
        let config = RunConfig::default()
            .with_standalone(C_STANDALONE_DEVICE)
            .with_parallel_targets(vec![
                INTERP.to_string(),
                C_STANDALONE_DEVICE.to_string(),
            ]);
        let plan = planner.resolve(&config, &known_devices()).unwrap();

        let interp = plan.targets.iter().find(|t| t.name == INTERP).unwrap();
        let cc = plan.targets.iter().find(|t| t.name == CC).unwrap();
        assert!(interp.parallel_safe);
        assert!(!cc.parallel_safe);
        assert!(!plan.parallel_codegen_independent);
        assert!(plan.standalone.as_ref().unwrap().parallel_safe);
        assert_eq!(plan.parallel_names(), vec![INTERP, C_STANDALONE_DEVICE]);
    }

    #[test]
    fn openmp_only_applies_to_the_capable_standalone() {
        let planner = make_planner(vec![]);

        let without_standalone = RunConfig::default().with_openmp(true);
        let plan = planner
            .resolve(&without_standalone, &known_devices())
            .unwrap();
        assert!(!plan.openmp);

        let with_standalone = RunConfig::default()
            .with_openmp(true)
            .with_standalone(C_STANDALONE_DEVICE);
        let plan = planner.resolve(&with_standalone, &known_devices()).unwrap();
        assert!(plan.openmp);
    }

    #[test]
    fn no_standalone_means_no_standalone_phases() {
        let planner = make_planner(vec![]);
        let plan = planner
            .resolve(&RunConfig::default(), &known_devices())
            .unwrap();
        assert!(plan.standalone.is_none());
        assert!(!plan.openmp);
    }
}
