// Suite runner
// Sequences the test phases across targets and devices with full state restore.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caches::CacheSet;
use crate::checkpoint::CheckpointGuard;
use crate::classify::UnimplementedPolicy;
use crate::config::{ParallelConfig, RunConfig};
use crate::device::{ActivationOptions, DeviceController, DeviceRegistry, RUNTIME_DEVICE};
use crate::dispatch::ParallelDispatcher;
use crate::error::{SuiteError, SuiteResult};
use crate::events::{EventSender, ProgressSender, SuiteEvent};
use crate::exec::{ExecReport, ExecRequest, TestExecutor};
use crate::filter::{tags, FilterExpr};
use crate::logging::LogControl;
use crate::plan::{MatrixPlanner, RunPlan, Target, INTERP};
use crate::prefs::{keys, PrefValue, PreferenceStore};

/// Compiler flags favouring compile speed over generated-code speed.
const FAST_COMPILE_FLAGS: &str = "-w -O0";
/// Thread count used for the OpenMP phases.
const OPENMP_TEST_THREADS: i64 = 4;

/// Outcome of a single phase.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub label: String,
    pub passed: bool,
    pub report: ExecReport,
    pub duration: Duration,
}

/// Aggregated result of a full run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub phases: Vec<PhaseOutcome>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.phases.iter().all(|phase| phase.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.phases.iter().filter(|phase| phase.passed).count()
    }

    pub fn total(&self) -> usize {
        self.phases.len()
    }

    /// One line summary in the style test drivers print at the end.
    pub fn summary(&self) -> String {
        let passed = self.passed_count();
        let total = self.total();
        if self.success() {
            format!("OK: {}/{} test phase(s) completed successfully.", passed, total)
        } else {
            format!(
                "ERROR: only {}/{} test phase(s) completed successfully (see above).",
                passed, total
            )
        }
    }
}

/// Sequences the full test matrix over targets and devices.
///
/// A run walks up to six phase groups: codegen-independent tests, the
/// per-target runtime phases, standalone single-run and multiple-run
/// phases, their OpenMP variants and the standalone-specific tests. Caches
/// are cleared between phases, standalone devices are reset after each
/// build and preferences plus log level are restored however the run ends.
pub struct SuiteRunner {
    prefs: Arc<dyn PreferenceStore>,
    log: Arc<dyn LogControl>,
    registry: Arc<dyn DeviceRegistry>,
    executor: Arc<dyn TestExecutor>,
    planner: MatrixPlanner,
    caches: CacheSet,
    test_root: PathBuf,
    events: Option<ProgressSender>,
}

impl SuiteRunner {
    pub fn new(
        prefs: Arc<dyn PreferenceStore>,
        log: Arc<dyn LogControl>,
        registry: Arc<dyn DeviceRegistry>,
        executor: Arc<dyn TestExecutor>,
    ) -> Self {
        Self {
            prefs,
            log,
            registry,
            executor,
            planner: MatrixPlanner::default(),
            caches: CacheSet::standard(),
            test_root: PathBuf::from("."),
            events: None,
        }
    }

    pub fn with_planner(mut self, planner: MatrixPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_caches(mut self, caches: CacheSet) -> Self {
        self.caches = caches;
        self
    }

    pub fn with_test_root(mut self, test_root: PathBuf) -> Self {
        self.test_root = test_root;
        self
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Runs the configured matrix and reports per-phase outcomes.
    ///
    /// Preferences and the console log level are restored on every exit
    /// path; the active device is reset even when a phase errors out.
    pub async fn run(&self, config: &RunConfig) -> SuiteResult<RunReport> {
        let plan = self.planner.resolve(config, &self.registry.known_devices())?;
        let directories = self.test_directories(config);
        self.announce(config, &plan, &directories);

        let guard = CheckpointGuard::acquire(
            Arc::clone(&self.prefs),
            Arc::clone(&self.log),
            config.reset_preferences,
        );
        if config.reset_preferences {
            eprintln!("Resetting to default preferences");
            self.prefs.reset_to_defaults();
        }
        self.apply_run_preferences(config);

        let mut device = DeviceController::new(Arc::clone(&self.registry));
        let started = Instant::now();
        let outcome = self
            .run_phases(config, &plan, &directories, &mut device)
            .await;
        let reset_outcome = device.reset().await;

        let phases = match outcome {
            Ok(phases) => {
                reset_outcome?;
                phases
            }
            Err(err) => {
                // First error wins; the guard restores on drop. A reset
                // failure on top of it still gets reported so a leaked
                // build directory is visible.
                if let Err(reset_err) = reset_outcome {
                    eprintln!("Device reset after the failed run also failed: {}", reset_err);
                }
                return Err(err);
            }
        };
        guard.restore();

        let report = RunReport { phases };
        eprintln!("{}", report.summary());
        self.events.send_event(SuiteEvent::run_completed(
            report.passed_count(),
            report.total(),
            started.elapsed(),
        ));
        Ok(report)
    }

    fn test_directories(&self, config: &RunConfig) -> Vec<PathBuf> {
        let mut directories = vec![self.test_root.clone()];
        directories.extend(config.extra_test_dirs.iter().cloned());
        directories
    }

    fn announce(&self, config: &RunConfig, plan: &RunPlan, directories: &[PathBuf]) {
        let dirs: Vec<String> = directories
            .iter()
            .map(|directory| directory.display().to_string())
            .collect();
        eprintln!(
            "Running tests in {} for targets {} ({} long tests)",
            dirs.join(", "),
            plan.target_names().join(", "),
            if config.long_tests { "including" } else { "excluding" }
        );
        eprintln!(
            "Running spindle version {} from '{}'",
            env!("CARGO_PKG_VERSION"),
            self.test_root.display()
        );
        if let Some(standalone) = &plan.standalone {
            eprintln!("Testing standalone device {}", standalone.name);
        }
        if config.test_codegen_independent {
            eprintln!("Testing codegen-independent code");
        }
        let parallel = plan.parallel_names();
        if !parallel.is_empty() {
            eprintln!("Testing with multiple processes for {}", parallel.join(", "));
        }
        self.events.send_event(SuiteEvent::run_started(
            directories.to_vec(),
            plan.target_names().iter().map(|name| name.to_string()).collect(),
            plan.standalone.as_ref().map(|target| target.name.clone()),
            config.long_tests,
        ));
    }

    fn apply_run_preferences(&self, config: &RunConfig) {
        if let Some(precision) = config.float_precision {
            eprintln!("Setting float precision to {}", precision);
            self.prefs
                .set(keys::FLOAT_PRECISION, PrefValue::from(precision.pref_value()));
        }
        // Tests compile a lot of generated code; trade runtime for build time.
        let flags = match self.prefs.get(keys::CC_EXTRA_FLAGS) {
            Some(PrefValue::Str(existing)) if !existing.is_empty() => {
                format!("{} {}", existing, FAST_COMPILE_FLAGS)
            }
            _ => FAST_COMPILE_FLAGS.to_string(),
        };
        self.prefs.set(keys::CC_EXTRA_FLAGS, PrefValue::Str(flags));
    }

    async fn run_phases(
        &self,
        config: &RunConfig,
        plan: &RunPlan,
        directories: &[PathBuf],
        device: &mut DeviceController,
    ) -> SuiteResult<Vec<PhaseOutcome>> {
        let policy = config.policy();
        let mut phases = Vec::new();

        if config.test_codegen_independent {
            device.activate_runtime().await?;
            self.events
                .send_event(SuiteEvent::device_activated(RUNTIME_DEVICE, false));
            // Some doc examples do generate code; pin the interpreted target
            // for them.
            self.prefs
                .set(keys::CODEGEN_TARGET, PrefValue::from(INTERP));
            let filter = FilterExpr::new().include(tags::CODEGEN_INDEPENDENT);
            let request = self
                .base_request(directories, filter, policy, device)
                .with_doc_examples(config.doc_examples);
            phases.push(
                self.execute_phase(
                    "codegen-independent",
                    request,
                    plan.parallel_codegen_independent,
                    &config.pool,
                )
                .await?,
            );
            self.clear_caches();
        }

        for target in &plan.targets {
            device.activate_runtime().await?;
            self.events
                .send_event(SuiteEvent::device_activated(RUNTIME_DEVICE, false));
            self.prefs
                .set(keys::CODEGEN_TARGET, PrefValue::from(target.name.as_str()));
            self.prefs.set(
                keys::STRING_EXPRESSION_TARGET,
                PrefValue::from(target.name.as_str()),
            );
            let filter = FilterExpr::new()
                .exclude(tags::STANDALONE_ONLY)
                .exclude(tags::CODEGEN_INDEPENDENT)
                .exclude_if(!config.long_tests, tags::LONG);
            let label = format!("target {}", target.name);
            let request = self.base_request(directories, filter, policy, device);
            phases.push(
                self.execute_phase(&label, request, target.parallel_safe, &config.pool)
                    .await?,
            );
            self.clear_caches();
        }

        if let Some(standalone) = &plan.standalone {
            phases.push(
                self.standalone_phase(
                    config,
                    directories,
                    device,
                    standalone,
                    "standalone single-run",
                    standalone_filter(config.long_tests, false),
                    true,
                    standalone.parallel_safe,
                )
                .await?,
            );
            phases.push(
                self.standalone_phase(
                    config,
                    directories,
                    device,
                    standalone,
                    "standalone multiple-runs",
                    standalone_filter(config.long_tests, true),
                    false,
                    standalone.parallel_safe,
                )
                .await?,
            );

            if plan.openmp {
                let outcome = self
                    .openmp_phases(config, directories, device, standalone, &mut phases)
                    .await;
                // The thread count must come back to neutral even on error.
                self.prefs.set(keys::OPENMP_THREADS, PrefValue::Int(0));
                outcome?;
            }

            let specific = FilterExpr::new()
                .include(standalone.name.as_str())
                .exclude_if(!config.test_openmp, tags::OPENMP);
            let label = format!("standalone-specific ({})", standalone.name);
            phases.push(
                self.standalone_phase(
                    config,
                    directories,
                    device,
                    standalone,
                    &label,
                    specific,
                    true,
                    standalone.parallel_safe,
                )
                .await?,
            );
        }

        Ok(phases)
    }

    async fn openmp_phases(
        &self,
        config: &RunConfig,
        directories: &[PathBuf],
        device: &mut DeviceController,
        standalone: &Target,
        phases: &mut Vec<PhaseOutcome>,
    ) -> SuiteResult<()> {
        self.prefs
            .set(keys::OPENMP_THREADS, PrefValue::Int(OPENMP_TEST_THREADS));
        phases.push(
            self.standalone_phase(
                config,
                directories,
                device,
                standalone,
                "standalone single-run (openmp)",
                standalone_filter(config.long_tests, false),
                true,
                false,
            )
            .await?,
        );
        phases.push(
            self.standalone_phase(
                config,
                directories,
                device,
                standalone,
                "standalone multiple-runs (openmp)",
                standalone_filter(config.long_tests, true),
                false,
                false,
            )
            .await?,
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn standalone_phase(
        &self,
        config: &RunConfig,
        directories: &[PathBuf],
        device: &mut DeviceController,
        standalone: &Target,
        label: &str,
        filter: FilterExpr,
        build_on_run: bool,
        parallel: bool,
    ) -> SuiteResult<PhaseOutcome> {
        let options = ActivationOptions::default()
            .with_build_on_run(build_on_run)
            .with_build_options(config.build_options.clone());
        device.activate_standalone(&standalone.name, &options).await?;
        self.events
            .send_event(SuiteEvent::device_activated(&standalone.name, build_on_run));

        let request = self.base_request(directories, filter, config.policy(), device);
        let outcome = self
            .execute_phase(label, request, parallel, &config.pool)
            .await?;

        device.complete_build()?;
        self.clear_caches();
        device.reset().await?;
        self.events
            .send_event(SuiteEvent::device_reset(&standalone.name));
        Ok(outcome)
    }

    fn base_request(
        &self,
        directories: &[PathBuf],
        filter: FilterExpr,
        policy: UnimplementedPolicy,
        device: &DeviceController,
    ) -> ExecRequest {
        ExecRequest::new(directories.to_vec(), filter.to_string(), policy)
            .with_preferences(self.prefs.snapshot())
            .with_env(device.execution_env())
    }

    async fn execute_phase(
        &self,
        label: &str,
        request: ExecRequest,
        parallel: bool,
        pool: &ParallelConfig,
    ) -> SuiteResult<PhaseOutcome> {
        eprintln!("Running {} tests", label);
        self.events
            .send_event(SuiteEvent::phase_started(label, &request.filter, parallel));
        let started = Instant::now();
        let report = if parallel {
            let mut dispatcher =
                ParallelDispatcher::new(Arc::clone(&self.executor), pool.clone());
            if let Some(sender) = &self.events {
                dispatcher = dispatcher.with_progress(sender.clone());
            }
            dispatcher.run(&request).await?
        } else {
            self.executor.run(&request).await?
        };
        let duration = started.elapsed();
        let passed = report.passed_under(request.policy);
        self.events
            .send_event(SuiteEvent::phase_completed(label, passed, duration));
        Ok(PhaseOutcome {
            label: label.to_string(),
            passed,
            report,
            duration,
        })
    }

    fn clear_caches(&self) {
        let count = self.caches.clear_all();
        self.events.send_event(SuiteEvent::caches_cleared(count));
    }
}

/// Filter for the standalone-compatible phases.
fn standalone_filter(long_tests: bool, multiple_runs: bool) -> FilterExpr {
    let filter = FilterExpr::new()
        .include(tags::STANDALONE_COMPATIBLE)
        .exclude_if(!long_tests, tags::LONG);
    if multiple_runs {
        filter.include(tags::MULTIPLE_RUNS)
    } else {
        filter.exclude(tags::MULTIPLE_RUNS)
    }
}
