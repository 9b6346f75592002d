//! External collaborator contracts (spec §6) plus the tagged-variant
//! registries that replace reflective class-name dispatch (DESIGN NOTES
//! §9): unknown tags fail `InitFailure` explicitly instead of reflecting
//! on a string at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{InstanceProfile, Message};

/// A bounded, lazily-produced sequence of messages for one instance, plus
/// liveness/finish probes. Concrete implementations (a file tailer, a
/// directory watcher) live outside this crate.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn init(&mut self, profile: &InstanceProfile) -> Result<bool>;

    /// `Ok(None)` means nothing is available right now, not an error.
    async fn read(&mut self) -> Result<Option<Message>>;

    /// `false` once the underlying file has been removed/rotated beyond
    /// recognition.
    fn exists(&self) -> bool;

    /// `true` once no more data will ever come.
    fn finished(&self) -> bool;

    async fn destroy(&mut self);
}

/// The transport a `SinkPipeline` flushes batches to (e.g. a dataproxy
/// client). Concrete implementations live outside this crate; this trait
/// only captures what the pipeline needs to drive acks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn init(&mut self) -> Result<bool>;

    /// Delivers one batch for one stream key. Implementations may return
    /// `Err(EngineError::TransportRetryable)`, in which case the pipeline
    /// retries the same batch indefinitely (spec §4.5 failure policy);
    /// any other error is treated the same way since the pipeline never
    /// drops messages short of shutdown.
    async fn send_batch(&self, stream_key: &str, batch: &[Message]) -> Result<()>;

    async fn destroy(&mut self);
}

type SourceCtor = dyn Fn() -> Box<dyn SourceAdapter> + Send + Sync;
type TransportCtor = dyn Fn() -> Box<dyn Transport> + Send + Sync;

/// Tag -> constructor registry for `SourceAdapter`s, populated by the
/// embedding binary/tests rather than by this crate (which knows nothing
/// concrete about file tailers or dataproxy clients).
#[derive(Clone, Default)]
pub struct SourceRegistry {
    ctors: Arc<HashMap<String, Arc<SourceCtor>>>,
}

impl SourceRegistry {
    pub fn builder() -> SourceRegistryBuilder {
        SourceRegistryBuilder {
            ctors: HashMap::new(),
        }
    }

    pub fn build(&self, tag: &str) -> Option<Box<dyn SourceAdapter>> {
        self.ctors.get(tag).map(|ctor| ctor())
    }
}

pub struct SourceRegistryBuilder {
    ctors: HashMap<String, Arc<SourceCtor>>,
}

impl SourceRegistryBuilder {
    pub fn register(
        mut self,
        tag: impl Into<String>,
        ctor: impl Fn() -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    ) -> Self {
        self.ctors.insert(tag.into(), Arc::new(ctor));
        self
    }

    pub fn build(self) -> SourceRegistry {
        SourceRegistry {
            ctors: Arc::new(self.ctors),
        }
    }
}

/// Tag -> constructor registry for `Transport`s.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    ctors: Arc<HashMap<String, Arc<TransportCtor>>>,
}

impl TransportRegistry {
    pub fn builder() -> TransportRegistryBuilder {
        TransportRegistryBuilder {
            ctors: HashMap::new(),
        }
    }

    pub fn build(&self, tag: &str) -> Option<Box<dyn Transport>> {
        self.ctors.get(tag).map(|ctor| ctor())
    }
}

pub struct TransportRegistryBuilder {
    ctors: HashMap<String, Arc<TransportCtor>>,
}

impl TransportRegistryBuilder {
    pub fn register(
        mut self,
        tag: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Transport> + Send + Sync + 'static,
    ) -> Self {
        self.ctors.insert(tag.into(), Arc::new(ctor));
        self
    }

    pub fn build(self) -> TransportRegistry {
        TransportRegistry {
            ctors: Arc::new(self.ctors),
        }
    }
}
