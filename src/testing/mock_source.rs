//! An in-memory `SourceAdapter` for exercising the engine end to end,
//! modeled on the teacher's `test_util::mock::sources` (see
//! `basic.rs`/`backpressure.rs` in the retrieval pack): a tiny adapter
//! with an externally-driven handle the test controls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::adapters::SourceAdapter;
use crate::error::Result;
use crate::model::{InstanceProfile, Message};

pub struct MockSource {
    messages: Arc<StdMutex<VecDeque<Message>>>,
    exists: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct MockSourceHandle {
    messages: Arc<StdMutex<VecDeque<Message>>>,
    exists: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockSourceHandle {
    pub fn set_exists(&self, exists: bool) {
        self.exists.store(exists, Ordering::Release);
    }

    /// Marks that no further messages will ever be produced; combined
    /// with an empty queue this is what `finished()` reports.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn push(&self, message: Message) {
        self.messages.lock().unwrap().push_back(message);
    }

    pub fn remaining(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

pub fn mock_source(messages: Vec<Message>) -> (MockSource, MockSourceHandle) {
    let messages = Arc::new(StdMutex::new(messages.into_iter().collect::<VecDeque<_>>()));
    let exists = Arc::new(AtomicBool::new(true));
    let closed = Arc::new(AtomicBool::new(false));
    let handle = MockSourceHandle {
        messages: messages.clone(),
        exists: exists.clone(),
        closed: closed.clone(),
    };
    (
        MockSource {
            messages,
            exists,
            closed,
        },
        handle,
    )
}

#[async_trait]
impl SourceAdapter for MockSource {
    async fn init(&mut self, _profile: &InstanceProfile) -> Result<bool> {
        Ok(true)
    }

    async fn read(&mut self) -> Result<Option<Message>> {
        Ok(self.messages.lock().unwrap().pop_front())
    }

    fn exists(&self) -> bool {
        self.exists.load(Ordering::Acquire)
    }

    fn finished(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.messages.lock().unwrap().is_empty()
    }

    async fn destroy(&mut self) {}
}

/// Wraps a single, pre-built `SourceAdapter` so it can be handed to a
/// `SourceRegistry`, which expects a repeatable constructor. Tests build
/// exactly one instance per registration, so "used more than once" is a
/// test bug, not a runtime condition to handle gracefully.
pub fn single_use_source_ctor(
    source: MockSource,
) -> impl Fn() -> Box<dyn SourceAdapter> + Send + Sync + 'static {
    let slot = StdMutex::new(Some(source));
    move || {
        let source = slot
            .lock()
            .unwrap()
            .take()
            .expect("mock source registered for single use");
        Box::new(source)
    }
}
