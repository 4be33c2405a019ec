use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::broker::{BrokerClient, CommittedOffset, PeekableIterator};
use crate::config::ReadSettings;
use crate::error::Error;
use crate::format::{ConsumerRecord, EmbeddedFormat};

/// The iterator held by a topic state. `None` until the first read opens it.
pub(crate) type IteratorSlot = Option<PeekableIterator>;

/// Carried-over accumulation of a read that failed after buffering
/// messages. The next read of the topic resumes from it, so no delivered
/// offset is ever skipped.
pub(crate) struct FailedRead {
    pub records: Vec<ConsumerRecord>,
    pub bytes_consumed: usize,
    pub exceeded_min_response_bytes: bool,
    pub will_exceed_max_response_bytes: bool,
}

/// Serialized access point to one broker iterator: the offset ledger, the
/// in-use exclusivity flag, and the failed-read carry-over slot.
pub struct TopicState {
    topic: String,
    // Locking this is the in-use flag: the guard is held by the one task
    // currently advancing a read, from lazy bind until finish.
    iterator: Arc<tokio::sync::Mutex<IteratorSlot>>,
    offsets: Mutex<HashMap<i32, i64>>,
    failed_read: Mutex<Option<FailedRead>>,
}

impl TopicState {
    fn new(topic: String) -> Self {
        Self {
            topic,
            iterator: Arc::new(tokio::sync::Mutex::new(None)),
            offsets: Mutex::new(HashMap::new()),
            failed_read: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Acquire the in-use flag, or `None` while another read holds it.
    pub(crate) fn try_acquire(&self) -> Option<OwnedMutexGuard<IteratorSlot>> {
        self.iterator.clone().try_lock_owned().ok()
    }

    /// Drain the carry-over slot.
    pub(crate) fn clear_failed_read(&self) -> Option<FailedRead> {
        self.failed_read.lock().unwrap().take()
    }

    /// Store a failed read's accumulation. The slot must be empty.
    pub(crate) fn set_failed_read(&self, failed: FailedRead) {
        let mut slot = self.failed_read.lock().unwrap();
        debug_assert!(slot.is_none(), "carry-over slot already occupied");
        *slot = Some(failed);
    }

    /// Record offsets of records handed to the caller. Offsets only move
    /// forward; this is the task's atomic commit point.
    pub(crate) fn record_delivered(&self, records: &[ConsumerRecord]) {
        let mut offsets = self.offsets.lock().unwrap();
        for record in records {
            offsets
                .entry(record.partition)
                .and_modify(|offset| *offset = (*offset).max(record.offset))
                .or_insert(record.offset);
        }
    }

    /// Snapshot of `partition -> last consumed offset`, in partition order.
    pub fn consumed_offsets(&self) -> Vec<CommittedOffset> {
        let offsets = self.offsets.lock().unwrap();
        let mut snapshot: Vec<CommittedOffset> = offsets
            .iter()
            .map(|(&partition, &offset)| CommittedOffset {
                topic: self.topic.clone(),
                partition,
                offset,
            })
            .collect();
        snapshot.sort_by_key(|committed| committed.partition);
        snapshot
    }
}

/// One registered consumer instance: its broker connection, record factory,
/// effective read settings, and (at most one) bound topic.
pub struct ConsumerState {
    group: String,
    id: String,
    format: EmbeddedFormat,
    settings: ReadSettings,
    client: Box<dyn BrokerClient>,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    shutting_down: AtomicBool,
    last_activity_ms: AtomicU64,
}

impl ConsumerState {
    pub fn new(
        group: String,
        id: String,
        format: EmbeddedFormat,
        settings: ReadSettings,
        client: Box<dyn BrokerClient>,
    ) -> Self {
        Self {
            group,
            id,
            format,
            settings,
            client,
            topics: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn settings(&self) -> ReadSettings {
        self.settings
    }

    pub(crate) fn client(&self) -> &dyn BrokerClient {
        self.client.as_ref()
    }

    /// Decode one raw message via the instance's declared format.
    pub(crate) fn make_record(
        &self,
        raw: &crate::broker::RawMessage,
    ) -> Result<(ConsumerRecord, usize), Error> {
        self.format.make_record(raw)
    }

    /// The topic state for `topic`, created on first use. An instance is
    /// bound to a single topic for its lifetime; a different topic fails
    /// with `AlreadySubscribed`.
    pub fn topic_state(&self, topic: &str) -> Result<Arc<TopicState>, Error> {
        let mut topics = self.topics.lock().unwrap();
        if let Some(state) = topics.get(topic) {
            return Ok(state.clone());
        }
        if let Some(bound) = topics.keys().next() {
            return Err(Error::AlreadySubscribed(bound.clone()));
        }
        let state = Arc::new(TopicState::new(topic.to_string()));
        topics.insert(topic.to_string(), state.clone());
        Ok(state)
    }

    /// Consumed offsets across the instance's topics.
    pub fn consumed_offsets(&self) -> Vec<CommittedOffset> {
        let topics = self.topics.lock().unwrap();
        let mut offsets: Vec<CommittedOffset> = topics
            .values()
            .flat_map(|state| state.consumed_offsets())
            .collect();
        offsets.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        offsets
    }

    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Record caller activity, for idle-instance expiration.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }
}
