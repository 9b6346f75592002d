//! An in-memory `Transport` for exercising `SinkPipeline`, modeled on the
//! teacher's `test_util::mock::sinks::backpressure` (retrieval pack): a
//! `gate` the test can close to simulate a stalled downstream ack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapters::Transport;
use crate::error::Result;
use crate::model::Message;

pub struct MockTransport {
    sent: Arc<StdMutex<Vec<(String, Vec<Message>)>>>,
    gate_open: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct MockTransportHandle {
    sent: Arc<StdMutex<Vec<(String, Vec<Message>)>>>,
    gate_open: Arc<AtomicBool>,
}

impl MockTransportHandle {
    pub fn open_gate(&self) {
        self.gate_open.store(true, Ordering::Release);
    }

    pub fn close_gate(&self) {
        self.gate_open.store(false, Ordering::Release);
    }

    pub fn sent_batches(&self) -> Vec<(String, Vec<Message>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_message_count(&self) -> usize {
        self.sent.lock().unwrap().iter().map(|(_, b)| b.len()).sum()
    }
}

pub fn mock_transport() -> (MockTransport, MockTransportHandle) {
    let sent = Arc::new(StdMutex::new(Vec::new()));
    let gate_open = Arc::new(AtomicBool::new(true));
    let handle = MockTransportHandle {
        sent: sent.clone(),
        gate_open: gate_open.clone(),
    };
    (MockTransport { sent, gate_open }, handle)
}

#[async_trait]
impl Transport for MockTransport {
    async fn init(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn send_batch(&self, stream_key: &str, batch: &[Message]) -> Result<()> {
        while !self.gate_open.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent
            .lock()
            .unwrap()
            .push((stream_key.to_string(), batch.to_vec()));
        Ok(())
    }

    async fn destroy(&mut self) {}
}

/// See `single_use_source_ctor`: same one-shot-constructor shim, for
/// transports.
pub fn single_use_transport_ctor(
    transport: MockTransport,
) -> impl Fn() -> Box<dyn Transport> + Send + Sync + 'static {
    let slot = StdMutex::new(Some(transport));
    move || {
        let transport = slot
            .lock()
            .unwrap()
            .take()
            .expect("mock transport registered for single use");
        Box::new(transport)
    }
}
