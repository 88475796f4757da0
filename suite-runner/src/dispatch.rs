// Parallel dispatch
// Worker pool that shards a request, restarts failed workers and folds reports.

use std::sync::Arc;

use crate::config::ParallelConfig;
use crate::error::SuiteError;
use crate::events::{EventSender, ProgressSender, SuiteEvent};
use crate::exec::{ExecReport, ExecRequest, TestExecutor};

/// Dispatches one request across a pool of worker processes.
#[derive(Clone)]
pub struct ParallelDispatcher {
    executor: Arc<dyn TestExecutor>,
    config: ParallelConfig,
    events: Option<ProgressSender>,
}

impl ParallelDispatcher {
    pub fn new(executor: Arc<dyn TestExecutor>, config: ParallelConfig) -> Self {
        Self {
            executor,
            config,
            events: None,
        }
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Runs the request across the pool and folds the shard reports.
    ///
    /// Every shard sees the same directories, filter and preferences plus its
    /// own shard assignment and the pool's process timeout. A shard whose
    /// worker crashes or times out is resubmitted up to the restart bound;
    /// past the bound the shard counts as failed instead of aborting the
    /// phase. A single-worker pool degenerates to a plain direct run.
    pub async fn run(&self, request: &ExecRequest) -> Result<ExecReport, SuiteError> {
        let workers = self.config.resolved_workers();
        if workers <= 1 {
            return self.executor.run(request).await;
        }

        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let executor = Arc::clone(&self.executor);
            let events = self.events.clone();
            let shard_request = request
                .clone()
                .sharded(shard, workers)
                .with_timeout(self.config.process_timeout());
            let max_restarts = self.config.max_restarts;
            handles.push(tokio::spawn(run_shard(
                executor,
                shard_request,
                shard,
                max_restarts,
                events,
            )));
        }

        let mut merged = ExecReport {
            ok: true,
            ..ExecReport::default()
        };
        for handle in handles {
            let report = handle
                .await
                .map_err(|err| SuiteError::WorkerPanic(err.to_string()))??;
            merged.merge(&report);
        }
        Ok(merged)
    }
}

async fn run_shard(
    executor: Arc<dyn TestExecutor>,
    request: ExecRequest,
    shard: usize,
    max_restarts: u32,
    events: Option<ProgressSender>,
) -> Result<ExecReport, SuiteError> {
    let mut attempt = 0u32;
    loop {
        match executor.run(&request).await {
            Ok(report) => return Ok(report),
            Err(err) if restartable(&err) => {
                if attempt >= max_restarts {
                    events.send_event(SuiteEvent::worker_failed(shard, &err.to_string()));
                    return Ok(ExecReport::default());
                }
                attempt += 1;
                events.send_event(SuiteEvent::worker_restarted(shard, attempt, &err.to_string()));
            }
            Err(err) => return Err(err),
        }
    }
}

/// Crashes and timeouts warrant a fresh worker; everything else aborts.
fn restartable(err: &SuiteError) -> bool {
    matches!(err, SuiteError::Timeout(_) | SuiteError::Crashed(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::classify::UnimplementedPolicy;
    use crate::events::progress_channel;

    fn pass_report(tests: u64) -> ExecReport {
        ExecReport {
            ok: true,
            tests,
            failures: 0,
            unimplemented: 0,
            skipped: 0,
        }
    }

    /// Executor that answers each shard from a scripted queue and records
    /// the shard assignments it saw.
    struct ScriptedExecutor {
        responses: Mutex<HashMap<usize, Vec<Result<ExecReport, SuiteError>>>>,
        seen: Mutex<Vec<Option<(usize, usize)>>>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn script(self, shard: usize, responses: Vec<Result<ExecReport, SuiteError>>) -> Self {
            self.responses.lock().unwrap().insert(shard, responses);
            self
        }

        fn shards_seen(&self) -> Vec<Option<(usize, usize)>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TestExecutor for ScriptedExecutor {
        async fn run(&self, request: &ExecRequest) -> Result<ExecReport, SuiteError> {
            self.seen.lock().unwrap().push(request.shard);
            let shard = request.shard.map(|(index, _)| index).unwrap_or(0);
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&shard) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(pass_report(1)),
            }
        }
    }

    fn make_request() -> ExecRequest {
        ExecRequest::new(Vec::new(), String::new(), UnimplementedPolicy::Strict)
    }

    fn make_config(workers: usize) -> ParallelConfig {
        ParallelConfig {
            workers,
            process_timeout_secs: 60,
            max_restarts: 2,
        }
    }

    #[tokio::test]
    async fn shards_cover_the_pool_and_reports_merge() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .script(0, vec![Ok(pass_report(3))])
                .script(1, vec![Ok(pass_report(4))]),
        );
        let dispatcher = ParallelDispatcher::new(executor.clone(), make_config(2));

        let report = dispatcher.run(&make_request()).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.tests, 7);

        let mut shards = executor.shards_seen();
        shards.sort();
        assert_eq!(shards, vec![Some((0, 2)), Some((1, 2))]);
    }

    #[tokio::test]
    async fn single_worker_pools_run_directly() {
        let executor = Arc::new(ScriptedExecutor::new());
        let dispatcher = ParallelDispatcher::new(executor.clone(), make_config(1));
        let report = dispatcher.run(&make_request()).await.unwrap();
        assert!(report.ok);
        assert_eq!(executor.shards_seen(), vec![None]);
    }

    #[tokio::test]
    async fn crashed_workers_are_restarted() {
        let executor = Arc::new(ScriptedExecutor::new().script(
            0,
            vec![
                Err(SuiteError::Crashed("exited with signal 11".to_string())),
                Ok(pass_report(5)),
            ],
        ));
        let (tx, mut rx) = progress_channel();
        let dispatcher =
            ParallelDispatcher::new(executor, make_config(2)).with_progress(tx);

        let report = dispatcher.run(&make_request()).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.tests, 6);

        let mut restarts = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SuiteEvent::WorkerRestarted { shard: 0, .. }) {
                restarts += 1;
            }
        }
        assert_eq!(restarts, 1);
    }

    #[tokio::test]
    async fn exhausted_restarts_fail_the_shard_not_the_phase() {
        let executor = Arc::new(ScriptedExecutor::new().script(
            0,
            vec![
                Err(SuiteError::Timeout(Duration::from_secs(60))),
                Err(SuiteError::Timeout(Duration::from_secs(60))),
                Err(SuiteError::Timeout(Duration::from_secs(60))),
            ],
        ));
        let (tx, mut rx) = progress_channel();
        let dispatcher =
            ParallelDispatcher::new(executor, make_config(2)).with_progress(tx);

        let report = dispatcher.run(&make_request()).await.unwrap();
        assert!(!report.ok);

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SuiteEvent::WorkerFailed { shard: 0, .. }) {
                failed = true;
            }
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn non_restartable_errors_abort_the_phase() {
        let executor = Arc::new(ScriptedExecutor::new().script(
            0,
            vec![Err(SuiteError::Config("empty harness command".to_string()))],
        ));
        let dispatcher = ParallelDispatcher::new(executor, make_config(2));
        let err = dispatcher.run(&make_request()).await.unwrap_err();
        assert!(matches!(err, SuiteError::Config(_)));
    }

    #[tokio::test]
    async fn shard_requests_carry_the_pool_timeout() {
        struct TimeoutCheck;

        #[async_trait]
        impl TestExecutor for TimeoutCheck {
            async fn run(&self, request: &ExecRequest) -> Result<ExecReport, SuiteError> {
                assert_eq!(request.timeout, Some(Duration::from_secs(60)));
                Ok(pass_report(1))
            }
        }

        let dispatcher = ParallelDispatcher::new(Arc::new(TimeoutCheck), make_config(2));
        dispatcher.run(&make_request()).await.unwrap();
    }
}
