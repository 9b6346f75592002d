//! Audit/metric events, one struct per occurrence, mirroring the
//! teacher's `internal_events` convention: each event knows how to both
//! log itself and emit its counters, so call sites stay one-liners.

use tracing::{debug, info, trace, warn};

pub trait InternalEvent {
    fn emit(self);
}

pub struct InstanceAdded<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
}

impl InternalEvent for InstanceAdded<'_> {
    fn emit(self) {
        info!(task_id = %self.task_id, instance_id = %self.instance_id, "instance added");
        metrics::counter!("instance_add_total").increment(1);
    }
}

pub struct InstanceAdmissionRejected<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
    pub reason: &'static str,
}

impl InternalEvent for InstanceAdmissionRejected<'_> {
    fn emit(self) {
        warn!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            reason = self.reason,
            "instance admission rejected"
        );
        metrics::counter!("instance_add_rejected_total").increment(1);
    }
}

pub struct InstanceFinished<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
}

impl InternalEvent for InstanceFinished<'_> {
    fn emit(self) {
        info!(task_id = %self.task_id, instance_id = %self.instance_id, "instance finished");
        metrics::counter!("instance_finish_total").increment(1);
    }
}

pub struct InstanceDeleted<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
}

impl InternalEvent for InstanceDeleted<'_> {
    fn emit(self) {
        info!(task_id = %self.task_id, instance_id = %self.instance_id, "instance deleted");
        metrics::counter!("instance_delete_total").increment(1);
    }
}

pub struct InstanceInitFailed<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
    pub reason: &'a str,
}

impl InternalEvent for InstanceInitFailed<'_> {
    fn emit(self) {
        warn!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            reason = %self.reason,
            "instance init failed"
        );
        metrics::counter!("instance_init_failure_total").increment(1);
    }
}

pub struct ManagerHeartbeat<'a> {
    pub task_id: &'a str,
    pub live_instances: usize,
}

impl InternalEvent for ManagerHeartbeat<'_> {
    fn emit(self) {
        info!(task_id = %self.task_id, live_instances = self.live_instances, "manager heartbeat");
        metrics::gauge!("manager_live_instances").set(self.live_instances as f64);
    }
}

pub struct InstanceHeartbeat<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
}

impl InternalEvent for InstanceHeartbeat<'_> {
    fn emit(self) {
        info!(task_id = %self.task_id, instance_id = %self.instance_id, "instance heartbeat");
        metrics::counter!("instance_heartbeat_total").increment(1);
    }
}

pub struct EndMessageDropped<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
}

impl InternalEvent for EndMessageDropped<'_> {
    fn emit(self) {
        warn!(task_id = %self.task_id, instance_id = %self.instance_id, "end message dropped");
        metrics::counter!("end_message_dropped_total").increment(1);
    }
}

pub struct BackpressureWait<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
    pub pool: &'a str,
}

impl InternalEvent for BackpressureWait<'_> {
    fn emit(self) {
        trace!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            pool = self.pool,
            "backpressure wait"
        );
        metrics::counter!("backpressure_wait_total").increment(1);
    }
}

pub struct OffsetCheckpoint<'a> {
    pub task_id: &'a str,
    pub instance_id: &'a str,
    pub offset: &'a str,
}

impl InternalEvent for OffsetCheckpoint<'_> {
    fn emit(self) {
        debug!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            offset = %self.offset,
            "checkpointing offset"
        );
        metrics::counter!("offset_checkpoint_total").increment(1);
    }
}

pub struct ExpiryGcSwept<'a> {
    pub task_id: &'a str,
    pub removed: usize,
}

impl InternalEvent for ExpiryGcSwept<'_> {
    fn emit(self) {
        info!(task_id = %self.task_id, removed = self.removed, "expiry gc swept instances");
        metrics::counter!("instance_expiry_gc_total").increment(self.removed as u64);
    }
}
