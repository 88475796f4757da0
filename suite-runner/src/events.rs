// Suite events
// Progress events emitted while a run executes, consumed by CLIs and logs.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

pub type ProgressSender = mpsc::UnboundedSender<SuiteEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<SuiteEvent>;

/// Creates the channel a runner reports progress on.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a test run.
#[derive(Debug, Clone)]
pub enum SuiteEvent {
    RunStarted {
        directories: Vec<PathBuf>,
        targets: Vec<String>,
        standalone: Option<String>,
        long_tests: bool,
    },
    PhaseStarted {
        label: String,
        filter: String,
        parallel: bool,
    },
    PhaseCompleted {
        label: String,
        passed: bool,
        duration: Duration,
    },
    DeviceActivated {
        device: String,
        build_on_run: bool,
    },
    DeviceReset {
        device: String,
    },
    CachesCleared {
        count: usize,
    },
    WorkerRestarted {
        shard: usize,
        attempt: u32,
        reason: String,
    },
    WorkerFailed {
        shard: usize,
        reason: String,
    },
    RunCompleted {
        passed: usize,
        total: usize,
        duration: Duration,
    },
}

impl SuiteEvent {
    pub fn run_started(
        directories: Vec<PathBuf>,
        targets: Vec<String>,
        standalone: Option<String>,
        long_tests: bool,
    ) -> Self {
        SuiteEvent::RunStarted {
            directories,
            targets,
            standalone,
            long_tests,
        }
    }

    pub fn phase_started(label: &str, filter: &str, parallel: bool) -> Self {
        SuiteEvent::PhaseStarted {
            label: label.to_string(),
            filter: filter.to_string(),
            parallel,
        }
    }

    pub fn phase_completed(label: &str, passed: bool, duration: Duration) -> Self {
        SuiteEvent::PhaseCompleted {
            label: label.to_string(),
            passed,
            duration,
        }
    }

    pub fn device_activated(device: &str, build_on_run: bool) -> Self {
        SuiteEvent::DeviceActivated {
            device: device.to_string(),
            build_on_run,
        }
    }

    pub fn device_reset(device: &str) -> Self {
        SuiteEvent::DeviceReset {
            device: device.to_string(),
        }
    }

    pub fn caches_cleared(count: usize) -> Self {
        SuiteEvent::CachesCleared { count }
    }

    pub fn worker_restarted(shard: usize, attempt: u32, reason: &str) -> Self {
        SuiteEvent::WorkerRestarted {
            shard,
            attempt,
            reason: reason.to_string(),
        }
    }

    pub fn worker_failed(shard: usize, reason: &str) -> Self {
        SuiteEvent::WorkerFailed {
            shard,
            reason: reason.to_string(),
        }
    }

    pub fn run_completed(passed: usize, total: usize, duration: Duration) -> Self {
        SuiteEvent::RunCompleted {
            passed,
            total,
            duration,
        }
    }
}

/// Fire-and-forget event emission. A closed or missing channel is ignored.
pub trait EventSender {
    fn send_event(&self, event: SuiteEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: SuiteEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: SuiteEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
