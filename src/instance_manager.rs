//! Per-task supervisor (spec §4.7): admission, reconciliation with the
//! durable store, action handling, and expiry GC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::ack_tracker::AckTracker;
use crate::action_bus::{Action, ActionBus};
use crate::adapters::{SourceRegistry, TransportRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::instance::Instance;
use crate::instance_store::InstanceStore;
use crate::internal_events::{
    InstanceAdded, InstanceAdmissionRejected, InstanceDeleted, InstanceFinished,
    InstanceInitFailed, InternalEvent, ManagerHeartbeat,
};
use crate::memory_budget::MemoryBudget;
use crate::model::{InstanceProfile, InstanceState, OffsetRecord};
use crate::offset_store::OffsetStore;
use crate::sink_pipeline::{SinkPipeline, SinkPipelineConfig};

const MAX_BATCH_MESSAGES: usize = 500;
const MAX_BATCH_BYTES: u64 = 1024 * 1024;

/// Read-only facts about the owning task, consulted for expiry GC
/// eligibility (spec §4.7). Date/cycle arithmetic beyond a plain
/// duration is an external collaborator (spec §1); `cycle_unit` is
/// supplied already resolved to a duration.
#[derive(Debug, Clone)]
pub struct TaskProfile {
    pub task_id: String,
    pub is_real_time: bool,
    pub is_retrying: bool,
    pub retry_finish: bool,
    pub cycle_unit: Duration,
}

pub struct InstanceManager {
    task_id: String,
    config: EngineConfig,
    task_profile: TaskProfile,
    instance_store: InstanceStore,
    offset_store: OffsetStore,
    memory: MemoryBudget,
    sources: SourceRegistry,
    transports: TransportRegistry,
    action_bus: Arc<ActionBus>,
    instance_map: DashMap<String, Arc<Instance>>,
    shutdown: CancellationToken,
    core_loop_handle: Mutex<Option<JoinHandle<()>>>,
    ran_at_least_once: AtomicBool,
}

impl InstanceManager {
    pub fn new(
        task_profile: TaskProfile,
        config: EngineConfig,
        db: &sled::Db,
        memory: MemoryBudget,
        sources: SourceRegistry,
        transports: TransportRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        memory.register_pool(config.writer_permit_pool(), config.agent_global_writer_permit);
        let task_id = task_profile.task_id.clone();
        Ok(Arc::new(Self {
            task_id,
            instance_store: InstanceStore::open(db)?,
            offset_store: OffsetStore::open(db)?,
            memory,
            sources,
            transports,
            action_bus: Arc::new(ActionBus::new(config.action_bus_capacity)),
            instance_map: DashMap::new(),
            shutdown: CancellationToken::new(),
            core_loop_handle: Mutex::new(None),
            ran_at_least_once: AtomicBool::new(false),
            task_profile,
            config,
        }))
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Exposed for the external task scheduler (out of scope per spec
    /// §1) to enqueue ADD/FINISH/DELETE commands.
    pub fn submit(&self, action: Action) -> bool {
        self.action_bus.submit(action)
    }

    pub fn instance_count(&self) -> usize {
        self.instance_map.len()
    }

    /// `instanceMap.size() + actionQueue.size() >= instanceLimit * 0.8`.
    pub fn is_full(&self) -> bool {
        let used = self.instance_map.len() + self.action_bus.len();
        (used as f64) >= (self.config.instance_limit as f64) * 0.8
    }

    pub async fn all_instances_finished(&self) -> Result<bool> {
        if !self.ran_at_least_once.load(Ordering::Acquire) {
            return Ok(false);
        }
        if !self.instance_map.is_empty() || !self.action_bus.is_empty() {
            return Ok(false);
        }
        let profiles = self.instance_store.list(&self.task_id)?;
        Ok(profiles
            .iter()
            .all(|p| p.state == InstanceState::Finished))
    }

    /// Loads profiles from the store; those with `state = Default` are
    /// reinstated into memory. Relies on the offset store so restarted
    /// instances resume at the last durable checkpoint.
    pub async fn restore_from_db(&self) -> Result<()> {
        for profile in self.instance_store.list(&self.task_id)? {
            if profile.state == InstanceState::Default {
                self.spawn_instance(profile).await;
            }
        }
        Ok(())
    }

    pub fn run(self: &Arc<Self>) {
        let me = self.clone();
        let handle = tokio::spawn(async move { me.core_loop().await });
        if let Ok(mut guard) = self.core_loop_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.core_loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let ids: Vec<String> = self.instance_map.iter().map(|e| e.key().clone()).collect();
        let teardowns = ids.into_iter().filter_map(|id| {
            self.instance_map
                .remove(&id)
                .map(|(_, instance)| async move { instance.destroy().await })
        });
        futures::future::join_all(teardowns).await;
    }

    /// Read-only peek at the durable store, for tests to assert on
    /// reconciliation/expiry outcomes without reaching into private state.
    #[cfg(feature = "testing")]
    pub fn debug_instance_profile(&self, instance_id: &str) -> Result<Option<InstanceProfile>> {
        self.instance_store.get(&self.task_id, instance_id)
    }

    #[cfg(feature = "testing")]
    pub fn debug_offset(&self, instance_id: &str) -> Result<Option<OffsetRecord>> {
        self.offset_store.get(&self.task_id, instance_id)
    }

    /// Pure function of the store state and the supplied `file_update_time`:
    /// no prior record admits; a prior `Finished` record admits only a
    /// strictly newer generation of the same file; a prior `Delete`
    /// record always re-admits; anything else (a live `Default` record)
    /// is skipped.
    pub fn should_add_again(
        prior: Option<&InstanceProfile>,
        file_update_time: DateTime<Utc>,
    ) -> bool {
        match prior {
            None => true,
            Some(p) if p.state == InstanceState::Delete => true,
            Some(p) if p.state == InstanceState::Finished => file_update_time > p.modify_time,
            Some(_) => false,
        }
    }

    async fn core_loop(self: Arc<Self>) {
        let mut last_gc: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.core_thread_sleep()) => {}
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            let due = last_gc
                .map(|t| t.elapsed() >= self.config.instance_db_clean_interval())
                .unwrap_or(true);
            if due {
                if let Err(err) = self.expiry_gc().await {
                    error!(task_id = %self.task_id, %err, "expiry gc failed");
                }
                last_gc = Some(Instant::now());
            }

            for action in self.action_bus.drain().await {
                self.handle_action(action).await;
            }

            if let Err(err) = self.keep_pace_with_db().await {
                error!(task_id = %self.task_id, %err, "reconciliation failed");
            }

            ManagerHeartbeat {
                task_id: &self.task_id,
                live_instances: self.instance_map.len(),
            }
            .emit();
            self.ran_at_least_once.store(true, Ordering::Release);
        }
    }

    async fn handle_action(&self, action: Action) {
        match action {
            Action::Add(profile) => self.handle_add(profile).await,
            Action::Finish(instance_id) => self.handle_finish(instance_id).await,
            Action::Delete(instance_id) => self.handle_delete(instance_id).await,
        }
    }

    async fn handle_add(&self, profile: InstanceProfile) {
        if self.instance_map.len() >= self.config.instance_limit {
            InstanceAdmissionRejected {
                task_id: &profile.task_id,
                instance_id: &profile.instance_id,
                reason: "instance_limit reached",
            }
            .emit();
            return;
        }

        let prior = match self
            .instance_store
            .get(&profile.task_id, &profile.instance_id)
        {
            Ok(prior) => prior,
            Err(err) => {
                warn!(task_id = %self.task_id, %err, "failed to read prior instance record");
                return;
            }
        };
        if !Self::should_add_again(prior.as_ref(), profile.file_update_time) {
            return;
        }

        let mut stored = profile.clone();
        stored.state = InstanceState::Default;
        stored.modify_time = Utc::now();
        if let Err(err) = self.instance_store.store(&stored) {
            warn!(task_id = %self.task_id, %err, "failed to persist new instance profile");
            return;
        }

        self.spawn_instance(stored).await;
    }

    async fn handle_finish(&self, instance_id: String) {
        if let Ok(Some(mut profile)) = self.instance_store.get(&self.task_id, &instance_id) {
            profile.state = InstanceState::Finished;
            profile.modify_time = Utc::now();
            if let Err(err) = self.instance_store.store(&profile) {
                warn!(task_id = %self.task_id, %err, "failed to persist finished state");
            }
        }
        if let Some((_, instance)) = self.instance_map.remove(&instance_id) {
            instance.destroy().await;
        }
        InstanceFinished {
            task_id: &self.task_id,
            instance_id: &instance_id,
        }
        .emit();
    }

    async fn handle_delete(&self, instance_id: String) {
        if let Err(err) = self.instance_store.delete(&self.task_id, &instance_id) {
            warn!(task_id = %self.task_id, %err, "failed to delete instance record");
        }
        if let Some((_, instance)) = self.instance_map.remove(&instance_id) {
            instance.destroy().await;
        }
        InstanceDeleted {
            task_id: &self.task_id,
            instance_id: &instance_id,
        }
        .emit();
    }

    /// Builds and starts a concrete `Instance` for an already-persisted
    /// `Default` profile (either a fresh ADD or a restart/reconciliation
    /// reinstatement). On `Instance::init` failure the instance is left
    /// unregistered and its offset is removed (spec §7 `InitFailure`
    /// policy).
    async fn spawn_instance(&self, profile: InstanceProfile) {
        let Some(source) = self.sources.build(&profile.source_class_tag) else {
            let err = EngineError::UnknownSourceTag {
                tag: profile.source_class_tag.clone(),
            };
            InstanceInitFailed {
                task_id: &profile.task_id,
                instance_id: &profile.instance_id,
                reason: &err.to_string(),
            }
            .emit();
            let _ = self
                .offset_store
                .delete(&profile.task_id, &profile.instance_id);
            return;
        };
        let Some(transport) = self.transports.build(&profile.sink_class_tag) else {
            let err = EngineError::UnknownSinkTag {
                tag: profile.sink_class_tag.clone(),
            };
            InstanceInitFailed {
                task_id: &profile.task_id,
                instance_id: &profile.instance_id,
                reason: &err.to_string(),
            }
            .emit();
            let _ = self
                .offset_store
                .delete(&profile.task_id, &profile.instance_id);
            return;
        };

        let ack_tracker = Arc::new(AckTracker::new(
            profile.task_id.clone(),
            profile.instance_id.clone(),
            profile.inode,
            self.config.writer_permit_pool(),
            self.memory.clone(),
            self.offset_store.clone(),
        ));
        let sink = SinkPipeline::new(
            SinkPipelineConfig {
                task_id: profile.task_id.clone(),
                instance_id: profile.instance_id.clone(),
                pool: self.config.writer_permit_pool(),
                batch_flush_interval: self.config.batch_flush_interval(),
                save_offset_interval: self.config.save_offset_interval(),
                max_batch_messages: MAX_BATCH_MESSAGES,
                max_batch_bytes: MAX_BATCH_BYTES,
                shutdown_grace: self.config.shutdown_grace(),
            },
            self.memory.clone(),
            ack_tracker,
            transport,
        );

        let instance = Arc::new(Instance::new(
            &profile,
            source,
            sink,
            self.offset_store.clone(),
            self.action_bus.clone(),
            self.config.check_finish_at_least_count,
            self.config.core_thread_sleep(),
        ));

        if instance.init(&profile).await {
            instance.start();
            InstanceAdded {
                task_id: &profile.task_id,
                instance_id: &profile.instance_id,
            }
            .emit();
            self.instance_map.insert(profile.instance_id.clone(), instance);
        } else {
            InstanceInitFailed {
                task_id: &profile.task_id,
                instance_id: &profile.instance_id,
                reason: "adapter init returned false",
            }
            .emit();
            let _ = self
                .offset_store
                .delete(&profile.task_id, &profile.instance_id);
        }
    }

    /// Reconciles in-memory state against the durable store (spec §4.7
    /// `keepPaceWithDb`). Idempotent: a second call with no external
    /// change mutates nothing.
    async fn keep_pace_with_db(&self) -> Result<()> {
        let profiles = self.instance_store.list(&self.task_id)?;
        let mut by_id = std::collections::HashMap::with_capacity(profiles.len());
        for profile in profiles {
            by_id.insert(profile.instance_id.clone(), profile);
        }

        // Store -> memory.
        for profile in by_id.values() {
            match profile.state {
                InstanceState::Default => {
                    if !self.instance_map.contains_key(&profile.instance_id) {
                        self.spawn_instance(profile.clone()).await;
                    }
                }
                // The source's own reconciliation falls through from
                // FINISHED into DELETE without a separator; both mean
                // "remove from memory" here (spec §9 open question).
                InstanceState::Finished | InstanceState::Delete => {
                    if let Some((_, instance)) = self.instance_map.remove(&profile.instance_id) {
                        instance.destroy().await;
                    }
                }
                InstanceState::Fatal => {
                    error!(
                        task_id = %self.task_id,
                        instance_id = %profile.instance_id,
                        "durable record in unexpected FATAL state; ignoring"
                    );
                }
            }
        }

        // Memory -> store.
        let live_ids: Vec<String> = self.instance_map.iter().map(|e| e.key().clone()).collect();
        for id in live_ids {
            let still_default = by_id
                .get(&id)
                .map(|p| p.state == InstanceState::Default)
                .unwrap_or(false);
            if !still_default {
                if let Some((_, instance)) = self.instance_map.remove(&id) {
                    instance.destroy().await;
                }
            }
        }

        Ok(())
    }

    async fn expiry_gc(&self) -> Result<()> {
        if self.task_profile.is_real_time {
            return Ok(());
        }
        if self.task_profile.is_retrying && !self.task_profile.retry_finish {
            return Ok(());
        }

        let cycle_unit = ChronoDuration::from_std(self.task_profile.cycle_unit)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let threshold = cycle_unit * self.config.db_instance_expire_cycle_count as i32;
        let now = Utc::now();

        let mut removed = 0usize;
        for profile in self.instance_store.list(&self.task_id)? {
            if removed >= self.config.clean_instance_once_limit {
                break;
            }
            if profile.state != InstanceState::Finished {
                continue;
            }
            if now - profile.modify_time > threshold {
                self.instance_store
                    .delete(&profile.task_id, &profile.instance_id)?;
                self.offset_store
                    .delete(&profile.task_id, &profile.instance_id)?;
                removed += 1;
            }
        }

        if removed > 0 {
            crate::internal_events::ExpiryGcSwept {
                task_id: &self.task_id,
                removed,
            }
            .emit();
        }
        Ok(())
    }
}
