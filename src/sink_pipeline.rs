//! Bounded, grouped, flush-on-timer buffer in front of a `Transport`
//! (spec §4.5). Functions as the `SinkAdapter` an `Instance` talks to:
//! `write` blocks (via small spin+sleep) on backpressure, a flusher loop
//! batches by stream key and hands batches to the transport, and a
//! checkpoint loop periodically drains the `AckTracker`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::ack_tracker::{AckHandle, AckTracker};
use crate::adapters::Transport;
use crate::error::Result;
use crate::internal_events::{BackpressureWait, EndMessageDropped, InternalEvent};
use crate::memory_budget::MemoryBudget;
use crate::model::{Message, SinkItem};

const BACKPRESSURE_SPIN_SLEEP: Duration = Duration::from_millis(10);
const TRANSPORT_RETRY_SLEEP: Duration = Duration::from_millis(500);

struct Queued {
    message: Message,
    handle: AckHandle,
}

pub struct SinkPipelineConfig {
    pub task_id: String,
    pub instance_id: String,
    pub pool: &'static str,
    pub batch_flush_interval: Duration,
    pub save_offset_interval: Duration,
    pub max_batch_messages: usize,
    pub max_batch_bytes: u64,
    pub shutdown_grace: Duration,
}

pub struct SinkPipeline {
    task_id: String,
    instance_id: String,
    pool: &'static str,
    memory: MemoryBudget,
    ack_tracker: Arc<AckTracker>,
    transport: Arc<Mutex<Box<dyn Transport>>>,
    queues: Mutex<HashMap<String, VecDeque<Queued>>>,
    batch_flush_interval: Duration,
    save_offset_interval: Duration,
    max_batch_messages: usize,
    max_batch_bytes: u64,
    shutdown_grace: Duration,
    shutdown: AtomicBool,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl SinkPipeline {
    pub fn new(
        cfg: SinkPipelineConfig,
        memory: MemoryBudget,
        ack_tracker: Arc<AckTracker>,
        transport: Box<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id: cfg.task_id,
            instance_id: cfg.instance_id,
            pool: cfg.pool,
            memory,
            ack_tracker,
            transport: Arc::new(Mutex::new(transport)),
            queues: Mutex::new(HashMap::new()),
            batch_flush_interval: cfg.batch_flush_interval,
            save_offset_interval: cfg.save_offset_interval,
            max_batch_messages: cfg.max_batch_messages,
            max_batch_bytes: cfg.max_batch_bytes,
            shutdown_grace: cfg.shutdown_grace,
            shutdown: AtomicBool::new(false),
            loops: Mutex::new(None),
        })
    }

    /// Initializes the transport and starts the background flusher and
    /// checkpoint loops. Returns `false` if transport init fails.
    pub async fn init(self: &Arc<Self>) -> Result<bool> {
        let ok = self.transport.lock().await.init().await?;
        if !ok {
            return Ok(false);
        }
        let flusher = tokio::spawn(self.clone().flusher_loop());
        let checkpointer = tokio::spawn(self.clone().checkpoint_loop());
        *self.loops.lock().await = Some((flusher, checkpointer));
        Ok(true)
    }

    pub async fn write(&self, item: SinkItem) -> Result<()> {
        let message = match item {
            SinkItem::End => {
                EndMessageDropped {
                    task_id: &self.task_id,
                    instance_id: &self.instance_id,
                }
                .emit();
                return Ok(());
            }
            SinkItem::Data(message) => message,
        };

        let len = message.body.len() as u64;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.memory.try_acquire(self.pool, len) {
                break;
            }
            self.memory.report(self.pool, "backpressure_wait");
            BackpressureWait {
                task_id: &self.task_id,
                instance_id: &self.instance_id,
                pool: self.pool,
            }
            .emit();
            sleep(BACKPRESSURE_SPIN_SLEEP).await;
        }

        let handle = self.ack_tracker.enqueue(message.offset.clone(), len).await;
        let stream_key = message.stream_key().to_string();
        let mut queues = self.queues.lock().await;
        queues
            .entry(stream_key)
            .or_default()
            .push_back(Queued { message, handle });
        Ok(())
    }

    /// True iff the ack tracker is empty — used by the `Instance`
    /// termination protocol to confirm no outstanding acks remain.
    pub async fn finished(&self) -> bool {
        self.ack_tracker.is_empty().await
    }

    /// A flusher stuck in `send_with_retry`'s indefinite retry loop (spec
    /// §4.5 failure policy) may never observe the shutdown flag on its
    /// own, since the flag is only checked between attempts, not while an
    /// attempt is in flight. Past `shutdown_grace` its batch is abandoned
    /// by aborting the task outright, which drops the transport lock guard
    /// it was holding; `ack_tracker.clear()` then releases the abandoned
    /// entries' permits, matching "in-flight batches are abandoned and
    /// their permits released by Clear" (spec §4.5).
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some((flusher, checkpointer)) = self.loops.lock().await.take() {
            let flusher_abort = flusher.abort_handle();
            if tokio::time::timeout(self.shutdown_grace, flusher)
                .await
                .is_err()
            {
                warn!(
                    task_id = %self.task_id,
                    instance_id = %self.instance_id,
                    "flusher still retrying a transport send past the shutdown grace period, abandoning it"
                );
                flusher_abort.abort();
            }
            let _ = checkpointer.await;
        }
        self.ack_tracker.clear().await;
        self.transport.lock().await.destroy().await;
    }

    async fn flusher_loop(self: Arc<Self>) {
        loop {
            sleep(self.batch_flush_interval).await;
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            self.flush_once().await;
        }
    }

    /// Every stream key's batch is driven concurrently within this one
    /// call: a stream key stuck retrying a transport error (spec §4.5/§7)
    /// must not starve the other stream keys sharing this instance's
    /// flusher, since the spec's per-stream-key ordering guarantee implies
    /// independent progress per key, not a single shared blocking loop.
    /// Concurrent futures rather than spawned tasks, so aborting the
    /// flusher (see `shutdown`) abandons every in-flight send at once
    /// instead of leaking detached retry loops.
    async fn flush_once(&self) {
        let stream_keys: Vec<String> = {
            let queues = self.queues.lock().await;
            queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };

        let sends = stream_keys.into_iter().map(|stream_key| async move {
            let batch = self.take_batch(&stream_key).await;
            if !batch.is_empty() {
                self.send_with_retry(&stream_key, batch).await;
            }
        });
        futures::future::join_all(sends).await;
    }

    async fn take_batch(&self, stream_key: &str) -> Vec<Queued> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(stream_key) else {
            return Vec::new();
        };
        let mut batch = Vec::new();
        let mut bytes = 0u64;
        while batch.len() < self.max_batch_messages {
            let Some(front) = queue.front() else { break };
            let front_len = front.message.body.len() as u64;
            if !batch.is_empty() && bytes + front_len > self.max_batch_bytes {
                break;
            }
            bytes += front_len;
            batch.push(queue.pop_front().expect("front just peeked"));
        }
        batch
    }

    async fn send_with_retry(&self, stream_key: &str, batch: Vec<Queued>) {
        let messages: Vec<Message> = batch.iter().map(|q| q.message.clone()).collect();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let result = self
                .transport
                .lock()
                .await
                .send_batch(stream_key, &messages)
                .await;
            match result {
                Ok(()) => break,
                Err(err) => {
                    let retryable = crate::error::EngineError::TransportRetryable {
                        task_id: self.task_id.clone(),
                        instance_id: self.instance_id.clone(),
                        source: Box::new(err),
                    };
                    error!(
                        task_id = %self.task_id,
                        instance_id = %self.instance_id,
                        stream_key,
                        %retryable,
                        "transport send failed, retrying"
                    );
                    sleep(TRANSPORT_RETRY_SLEEP).await;
                }
            }
        }
        for queued in batch {
            self.ack_tracker.mark_acked(queued.handle).await;
        }
        debug!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            stream_key,
            count = messages.len(),
            "batch acked"
        );
    }

    async fn checkpoint_loop(self: Arc<Self>) {
        loop {
            sleep(self.save_offset_interval).await;
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if let Err(err) = self.ack_tracker.drain().await {
                error!(
                    task_id = %self.task_id,
                    instance_id = %self.instance_id,
                    %err,
                    "checkpoint drain failed"
                );
            }
        }
    }
}
