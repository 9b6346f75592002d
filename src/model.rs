//! Data model: `InstanceProfile`, `InstanceState`, `OffsetRecord`, and the
//! message types that flow between a `SourceAdapter` and the sink pipeline.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an instance. `Default` is the only non-terminal state;
/// `Finished`/`Delete` are durable-terminal, `Fatal` is terminal only in
/// memory (never persisted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Default,
    Finished,
    Delete,
    Fatal,
}

impl InstanceState {
    pub fn is_durable_terminal(self) -> bool {
        matches!(self, InstanceState::Finished | InstanceState::Delete)
    }
}

/// Immutable identity plus mutable lifecycle fields for a single file
/// instance within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceProfile {
    pub task_id: String,
    pub instance_id: String,
    pub source_class_tag: String,
    pub sink_class_tag: String,
    pub group_id: String,
    pub stream_id: String,
    pub file_update_time: DateTime<Utc>,
    pub source_data_time: DateTime<Utc>,
    pub sink_data_time: DateTime<Utc>,
    pub inode: i64,
    pub field_splitter: String,
    #[serde(default)]
    pub extras: HashMap<String, String>,
    pub state: InstanceState,
    pub modify_time: DateTime<Utc>,
}

impl InstanceProfile {
    /// A fresh profile for a newly admitted instance, `state = Default`.
    pub fn new(
        task_id: impl Into<String>,
        instance_id: impl Into<String>,
        source_class_tag: impl Into<String>,
        sink_class_tag: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            instance_id: instance_id.into(),
            source_class_tag: source_class_tag.into(),
            sink_class_tag: sink_class_tag.into(),
            group_id: String::new(),
            stream_id: String::new(),
            file_update_time: now,
            source_data_time: now,
            sink_data_time: now,
            inode: 0,
            field_splitter: String::new(),
            extras: HashMap::new(),
            state: InstanceState::Default,
            modify_time: now,
        }
    }
}

/// Durable checkpoint for `(task_id, instance_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub task_id: String,
    pub instance_id: String,
    pub offset: String,
    pub inode: i64,
    pub last_update_time: DateTime<Utc>,
}

impl OffsetRecord {
    pub fn is_well_formed(&self) -> bool {
        !self.task_id.is_empty() && !self.instance_id.is_empty() && !self.offset.is_empty()
    }
}

/// A unit of data read from a source and handed to the sink pipeline.
///
/// `offset` is the source's opaque read-position marker *after* this
/// message was produced; it is what eventually gets durably checkpointed
/// once the message is acknowledged.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: HashMap<String, String>,
    pub body: Bytes,
    pub offset: String,
}

impl Message {
    pub fn new(body: impl Into<Bytes>, offset: impl Into<String>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
            offset: offset.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    pub fn stream_key(&self) -> &str {
        self.header
            .get("streamKey")
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// What a `SourceAdapter` yields to its `Instance` and what an `Instance`
/// hands to the sink pipeline: either real data, or the `EndMessage`
/// sentinel, which the pipeline accepts but never forwards.
#[derive(Debug, Clone)]
pub enum SinkItem {
    Data(Message),
    End,
}
