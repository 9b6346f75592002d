//! Single-file state machine wiring a `SourceAdapter` to a `SinkPipeline`
//! (spec §4.6): `INIT -> RUNNING -> (DRAINING -> FINISHED_LOCAL) |
//! SOURCE_GONE | FATAL`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action_bus::{Action, ActionBus};
use crate::adapters::SourceAdapter;
use crate::error::EngineError;
use crate::internal_events::{InstanceHeartbeat, InternalEvent};
use crate::model::{InstanceProfile, SinkItem};
use crate::offset_store::OffsetStore;
use crate::sink_pipeline::SinkPipeline;

const ACTION_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Draining,
    FinishedLocal,
    SourceGone,
    Fatal,
}

pub struct Instance {
    task_id: String,
    instance_id: String,
    source: Mutex<Box<dyn SourceAdapter>>,
    sink: Arc<SinkPipeline>,
    offset_store: OffsetStore,
    action_bus: Arc<ActionBus>,
    shutdown: CancellationToken,
    inited: AtomicBool,
    run_state: Mutex<RunState>,
    finish_probe_count: AtomicU32,
    check_finish_at_least_count: u32,
    core_thread_sleep: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    pub fn new(
        profile: &InstanceProfile,
        source: Box<dyn SourceAdapter>,
        sink: Arc<SinkPipeline>,
        offset_store: OffsetStore,
        action_bus: Arc<ActionBus>,
        check_finish_at_least_count: u32,
        core_thread_sleep: Duration,
    ) -> Self {
        Self {
            task_id: profile.task_id.clone(),
            instance_id: profile.instance_id.clone(),
            source: Mutex::new(source),
            sink,
            offset_store,
            action_bus,
            shutdown: CancellationToken::new(),
            inited: AtomicBool::new(false),
            run_state: Mutex::new(RunState::Init),
            finish_probe_count: AtomicU32::new(0),
            check_finish_at_least_count,
            core_thread_sleep,
            worker: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Initializes source and sink. On failure transitions to `Fatal` and
    /// returns `Ok(false)`; the manager must not start the run loop in
    /// that case.
    pub async fn init(&self, profile: &InstanceProfile) -> bool {
        let source_ok = match self.source.lock().await.init(profile).await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "source init errored");
                false
            }
        };
        if !source_ok {
            *self.run_state.lock().await = RunState::Fatal;
            return false;
        }

        let sink_ok = match self.sink.init().await {
            Ok(ok) => ok,
            Err(err) => {
                warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "sink init errored");
                false
            }
        };
        if !sink_ok {
            *self.run_state.lock().await = RunState::Fatal;
            return false;
        }

        self.inited.store(true, Ordering::Release);
        *self.run_state.lock().await = RunState::Running;
        true
    }

    /// Spawns the run loop. No-op if `init` did not succeed.
    pub fn start(self: &Arc<Self>) {
        if !self.inited.load(Ordering::Acquire) {
            return;
        }
        let me = self.clone();
        let handle = tokio::spawn(async move { me.run_loop().await });
        // `worker` is only ever written here and read by `destroy`, both
        // of which happen at most once per instance lifetime from the
        // manager's single core loop thread.
        if let Ok(mut guard) = self.worker.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if !self.source.lock().await.exists() {
                self.handle_source_deleted().await;
                break;
            }

            let read = self.source.lock().await.read().await;
            match read {
                Ok(Some(message)) => {
                    if let Err(err) = self.sink.write(SinkItem::Data(message)).await {
                        warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "sink write failed");
                    }
                    self.finish_probe_count.store(0, Ordering::Release);
                }
                Ok(None) => {
                    let source_finished = self.source.lock().await.finished();
                    let sink_finished = self.sink.finished().await;
                    if source_finished && sink_finished {
                        let count = self.finish_probe_count.fetch_add(1, Ordering::AcqRel) + 1;
                        if count >= self.check_finish_at_least_count {
                            self.handle_finished().await;
                            break;
                        }
                    } else {
                        self.finish_probe_count.store(0, Ordering::Release);
                    }
                    InstanceHeartbeat {
                        task_id: &self.task_id,
                        instance_id: &self.instance_id,
                    }
                    .emit();
                    sleep(self.core_thread_sleep).await;
                }
                Err(err) => {
                    warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "source read failed");
                    sleep(self.core_thread_sleep).await;
                }
            }
        }
        // Only the naturally-finished path (DRAINING, set by
        // `handle_finished` just above) settles into FINISHED_LOCAL here;
        // SOURCE_GONE and a break on external shutdown already have (or
        // deliberately don't have) their own terminal state and must not
        // be overwritten.
        let mut state = self.run_state.lock().await;
        if *state == RunState::Draining {
            *state = RunState::FinishedLocal;
        }
    }

    async fn handle_source_deleted(&self) {
        *self.run_state.lock().await = RunState::SourceGone;
        let err = EngineError::SourceDeleted {
            task_id: self.task_id.clone(),
            instance_id: self.instance_id.clone(),
        };
        warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "source deleted");
        if let Err(err) = self.offset_store.delete(&self.task_id, &self.instance_id) {
            warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "failed to delete offset on source deletion");
        }
        self.submit_with_retry(Action::Delete(self.instance_id.clone()))
            .await;
    }

    async fn handle_finished(&self) {
        *self.run_state.lock().await = RunState::Draining;
        self.submit_with_retry(Action::Finish(self.instance_id.clone()))
            .await;
    }

    /// Retries submission with a 1s backoff until accepted or shutdown is
    /// observed (spec §4.6 termination protocol, §7 `QueueFull` policy).
    async fn submit_with_retry(&self, action: Action) {
        loop {
            if self.action_bus.submit(action.clone()) {
                return;
            }
            let err = EngineError::QueueFull {
                action_kind: action.kind().to_string(),
                instance_id: self.instance_id.clone(),
            };
            warn!(task_id = %self.task_id, instance_id = %self.instance_id, %err, "retrying action submission");
            if self.shutdown.is_cancelled() {
                return;
            }
            sleep(ACTION_RETRY_BACKOFF).await;
        }
    }

    /// Signals the run loop to stop, waits for it to observe termination,
    /// then destroys source and sink in that order. Safe to call before
    /// `init` completes successfully (no-ops when not inited) and safe to
    /// call concurrently with a still-running loop.
    pub async fn destroy(&self) {
        self.shutdown.cancel();

        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if self.inited.load(Ordering::Acquire) {
            self.source.lock().await.destroy().await;
            self.sink.shutdown().await;
            info!(task_id = %self.task_id, instance_id = %self.instance_id, "instance destroyed");
        }
    }
}
