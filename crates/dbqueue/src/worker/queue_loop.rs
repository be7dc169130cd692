//! The poll loop of one `(shard, queue)` pair

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::api::{NoopLifecycleListener, ThreadLifecycleListener};
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::runner::QueueRunner;
use crate::settings::{QueueLocation, QueueSettings, QueueShardId};

/// Where a loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Not started yet
    Idle,
    /// Inside a poll
    Running,
    /// Sleeping after a poll
    Waiting,
    /// Sleeping after a crashed poll
    Crashed,
    Stopped,
}

/// Decides when a loop stops and how it sleeps between polls
#[async_trait]
pub trait LoopPolicy: Send + Sync {
    fn is_stopped(&self) -> bool;

    /// Sleep up to `timeout`; may return early when the loop is stopping
    async fn wait(&self, timeout: Duration);
}

/// Runs until a shutdown signal is sent (or its sender dropped)
#[derive(Debug, Clone)]
pub struct ShutdownLoopPolicy {
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownLoopPolicy {
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { shutdown_rx }
    }
}

#[async_trait]
impl LoopPolicy for ShutdownLoopPolicy {
    fn is_stopped(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    async fn wait(&self, timeout: Duration) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                debug!("shutdown signal received during wait");
            }
        }
    }
}

/// Polls one queue on one shard until its policy stops it
///
/// Each cycle runs the runner once, reports to the thread listener and sleeps
/// for `between_task_timeout` after a processed task, `no_task_timeout` after
/// an empty poll and `fatal_crash_timeout` after a crash. A crash never ends
/// the loop.
pub struct QueueLoop {
    shard_id: QueueShardId,
    location: QueueLocation,
    settings: QueueSettings,
    runner: Box<dyn QueueRunner>,
    policy: Box<dyn LoopPolicy>,
    listener: Arc<dyn ThreadLifecycleListener>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<LoopState>,
}

impl QueueLoop {
    pub fn new(
        shard_id: QueueShardId,
        settings: QueueSettings,
        runner: Box<dyn QueueRunner>,
        policy: Box<dyn LoopPolicy>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            shard_id,
            location: runner.location().clone(),
            settings,
            runner,
            policy,
            listener: Arc::new(NoopLifecycleListener),
            clock: Arc::new(SystemClock),
            state_tx,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ThreadLifecycleListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shard_id(&self) -> &QueueShardId {
        &self.shard_id
    }

    pub fn location(&self) -> &QueueLocation {
        &self.location
    }

    /// Follow the loop's state from elsewhere
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    #[instrument(skip(self), fields(shard = %self.shard_id, queue = %self.location))]
    pub async fn run(self) {
        info!("queue loop started");
        while !self.policy.is_stopped() {
            let wait = self.run_cycle().await;
            self.policy.wait(wait).await;
        }
        self.state_tx.send_replace(LoopState::Stopped);
        info!("queue loop stopped");
    }

    /// One poll; returns how long to sleep afterwards
    pub async fn run_cycle(&self) -> Duration {
        self.state_tx.send_replace(LoopState::Running);
        self.listener.started(&self.shard_id, &self.location);

        let start = self.clock.now();
        let outcome = AssertUnwindSafe(self.runner.run_queue())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(QueueError::from_panic(panic)));

        let wait = match outcome {
            Ok(status) => {
                self.listener.executed(
                    &self.shard_id,
                    &self.location,
                    status,
                    self.clock.elapsed_since(start),
                );
                self.state_tx.send_replace(LoopState::Waiting);
                status.wait_timeout(&self.settings)
            }
            Err(error) => {
                self.listener
                    .crashed(&self.shard_id, &self.location, &error);
                self.state_tx.send_replace(LoopState::Crashed);
                self.settings.fatal_crash_timeout
            }
        };

        self.listener.finished(&self.shard_id, &self.location);
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::QueueProcessingStatus;
    use crate::clock::ManualClock;
    use crate::storage::StoreError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Step {
        Status(QueueProcessingStatus),
        Fail,
        Panic,
    }

    /// Plays back a fixed list of poll outcomes, each taking `took`
    struct ScriptedRunner {
        location: QueueLocation,
        steps: Mutex<VecDeque<Step>>,
        clock: Arc<ManualClock>,
        took: Duration,
    }

    #[async_trait]
    impl QueueRunner for ScriptedRunner {
        fn location(&self) -> &QueueLocation {
            &self.location
        }

        async fn run_queue(&self) -> Result<QueueProcessingStatus, QueueError> {
            self.clock.advance(self.took);
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Status(status)) => Ok(status),
                Some(Step::Fail) => Err(StoreError::Database("connection reset".into()).into()),
                Some(Step::Panic) => panic!("runner bug"),
                None => Ok(QueueProcessingStatus::Skipped),
            }
        }
    }

    /// Stops after a fixed number of cycles and records the requested waits
    struct CountingPolicy {
        remaining: AtomicUsize,
        waits: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait]
    impl LoopPolicy for CountingPolicy {
        fn is_stopped(&self) -> bool {
            self.remaining.load(Ordering::SeqCst) == 0
        }

        async fn wait(&self, timeout: Duration) {
            self.waits.lock().push(timeout);
            self.remaining.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingThreadListener {
        events: Mutex<Vec<String>>,
    }

    impl ThreadLifecycleListener for RecordingThreadListener {
        fn started(&self, _shard_id: &QueueShardId, _location: &QueueLocation) {
            self.events.lock().push("started".to_string());
        }

        fn executed(
            &self,
            _shard_id: &QueueShardId,
            _location: &QueueLocation,
            status: QueueProcessingStatus,
            elapsed: Duration,
        ) {
            self.events
                .lock()
                .push(format!("executed:{status:?}:{}ms", elapsed.as_millis()));
        }

        fn crashed(&self, _shard_id: &QueueShardId, _location: &QueueLocation, error: &QueueError) {
            self.events.lock().push(format!("crashed:{error}"));
        }

        fn finished(&self, _shard_id: &QueueShardId, _location: &QueueLocation) {
            self.events.lock().push("finished".to_string());
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings::new(Duration::from_millis(100), Duration::from_millis(10))
            .with_fatal_crash_timeout(Duration::from_secs(1))
    }

    fn queue_loop(
        steps: Vec<Step>,
        cycles: usize,
    ) -> (QueueLoop, Arc<Mutex<Vec<Duration>>>, Arc<RecordingThreadListener>) {
        let clock = Arc::new(ManualClock::default());
        let waits = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(RecordingThreadListener::default());
        let runner = ScriptedRunner {
            location: QueueLocation::new("queue_tasks", "loop").unwrap(),
            steps: Mutex::new(steps.into()),
            clock: clock.clone(),
            took: Duration::from_millis(7),
        };
        let policy = CountingPolicy {
            remaining: AtomicUsize::new(cycles),
            waits: waits.clone(),
        };

        let queue_loop = QueueLoop::new(
            QueueShardId::new("main"),
            settings(),
            Box::new(runner),
            Box::new(policy),
        )
        .with_listener(listener.clone())
        .with_clock(clock);
        (queue_loop, waits, listener)
    }

    #[tokio::test]
    async fn test_wait_depends_on_outcome() {
        let (queue_loop, waits, _) = queue_loop(
            vec![
                Step::Status(QueueProcessingStatus::Processed),
                Step::Status(QueueProcessingStatus::Skipped),
                Step::Fail,
                Step::Panic,
            ],
            4,
        );
        let state = queue_loop.subscribe();

        queue_loop.run().await;

        assert_eq!(
            *waits.lock(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(100),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(*state.borrow(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_listener_sees_every_cycle() {
        let (queue_loop, _, listener) = queue_loop(
            vec![Step::Status(QueueProcessingStatus::Processed), Step::Fail],
            2,
        );

        queue_loop.run().await;

        assert_eq!(
            *listener.events.lock(),
            vec![
                "started",
                "executed:Processed:7ms",
                "finished",
                "started",
                "crashed:database error: connection reset",
                "finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_state_after_cycle() {
        let (queue_loop, _, _) = queue_loop(vec![Step::Fail], 1);
        let state = queue_loop.subscribe();
        assert_eq!(*state.borrow(), LoopState::Idle);

        assert_eq!(queue_loop.run_cycle().await, Duration::from_secs(1));
        assert_eq!(*state.borrow(), LoopState::Crashed);

        queue_loop.run_cycle().await;
        assert_eq!(*state.borrow(), LoopState::Waiting);
    }

    #[tokio::test]
    async fn test_shutdown_policy_interrupts_wait() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = ShutdownLoopPolicy::new(shutdown_rx);
        assert!(!policy.is_stopped());

        let waiting = tokio::spawn(async move {
            policy.wait(Duration::from_secs(3600)).await;
            policy
        });
        shutdown_tx.send(true).unwrap();

        let policy = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("wait should end on shutdown")
            .unwrap();
        assert!(policy.is_stopped());
    }

    #[tokio::test]
    async fn test_shutdown_policy_stops_when_sender_dropped() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let policy = ShutdownLoopPolicy::new(shutdown_rx);
        drop(shutdown_tx);

        assert!(policy.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), policy.wait(Duration::from_secs(3600)))
            .await
            .expect("wait should end once the sender is gone");
    }
}
