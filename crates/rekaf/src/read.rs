use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use crate::broker::PeekableIterator;
use crate::clock::Clock;
use crate::consumer::{ConsumerState, FailedRead, IteratorSlot, TopicState};
use crate::error::Error;
use crate::format::ConsumerRecord;

/// Completion callback of one read. Fired exactly once, possibly from any
/// worker; `records` is `Some` (possibly empty) iff `err` is `None`.
pub type ReadCallback = Box<dyn FnOnce(Option<Vec<ConsumerRecord>>, Option<Error>) + Send>;

/// Outcome of one cooperative step, as a scheduling hint for the worker.
pub(crate) enum Step {
    /// The task finished and must be retired.
    Done,
    /// Another task holds the topic's iterator; retry at `wait_expiration`.
    Busy,
    /// More to do; re-queue at `wait_expiration`. `backoff` reports that
    /// the broker's bounded wait came up empty.
    Pending { backoff: bool },
}

enum Binding {
    Unbound,
    // Holding the guard is holding the topic's in-use flag.
    Bound(OwnedMutexGuard<IteratorSlot>),
}

/// The state machine driving one HTTP read from first fetch attempt to
/// callback completion.
///
/// A task stops on whichever comes first of its three conditions: the
/// response byte ceiling, the minimum-bytes floor, or the request deadline.
/// It is advanced in bounded cooperative steps by the worker pool and never
/// blocks a worker beyond a single bounded broker poll.
pub struct ReadTask {
    parent: Arc<ConsumerState>,
    topic_state: Arc<TopicState>,
    clock: Arc<dyn Clock>,

    records: Vec<ConsumerRecord>,
    bytes_consumed: usize,
    exceeded_min_response_bytes: bool,
    will_exceed_max_response_bytes: bool,

    // Config snapshot taken at construction.
    max_response_bytes: usize,
    request_timeout_ms: u64,
    // `None` disables the min-bytes shortcut (negative configured value).
    response_min_bytes: Option<usize>,
    iterator_backoff_ms: u64,
    iterator_timeout_ms: u64,

    started: u64,
    wait_expiration: u64,
    finished: bool,

    binding: Binding,
    callback: Option<ReadCallback>,
}

impl ReadTask {
    /// Build the task for one read. On a construction-time failure the
    /// callback fires immediately and no task is returned; nothing was
    /// acquired, so there is nothing to release or carry over.
    pub(crate) fn new(
        parent: Arc<ConsumerState>,
        clock: Arc<dyn Clock>,
        topic: &str,
        request_max_bytes: Option<usize>,
        callback: ReadCallback,
    ) -> Option<ReadTask> {
        let settings = parent.settings();
        let max_response_bytes = request_max_bytes
            .map_or(settings.max_response_bytes, |cap| {
                cap.min(settings.max_response_bytes)
            });
        let started = clock.now_ms();

        let topic_state = match parent.topic_state(topic) {
            Ok(state) => state,
            Err(err) => {
                complete(callback, None, Some(err));
                return None;
            }
        };

        let mut task = ReadTask {
            parent,
            topic_state: topic_state.clone(),
            clock,
            records: Vec::new(),
            bytes_consumed: 0,
            exceeded_min_response_bytes: false,
            will_exceed_max_response_bytes: false,
            max_response_bytes,
            request_timeout_ms: settings.request_timeout_ms,
            response_min_bytes: usize::try_from(settings.response_min_bytes).ok(),
            iterator_backoff_ms: settings.iterator_backoff_ms,
            iterator_timeout_ms: settings.iterator_timeout_ms,
            started,
            wait_expiration: started,
            finished: false,
            binding: Binding::Unbound,
            callback: Some(callback),
        };

        // Resume a prior read that failed with buffered messages. Timing is
        // this task's own; only the accumulation carries over.
        if let Some(prev) = topic_state.clear_failed_read() {
            task.records = prev.records;
            task.bytes_consumed = prev.bytes_consumed;
            task.exceeded_min_response_bytes = prev.exceeded_min_response_bytes;
            task.will_exceed_max_response_bytes = prev.will_exceed_max_response_bytes;
        }

        Some(task)
    }

    /// Next time the worker should reconsider this task.
    pub(crate) fn wait_expiration(&self) -> u64 {
        self.wait_expiration
    }

    /// One cooperative step: bind the iterator if needed, pull while the
    /// broker has messages and no stop condition trips, then evaluate the
    /// stop conditions against the wake-time bases.
    pub(crate) async fn do_partial_read(&mut self) -> Step {
        let iteration_start = self.clock.now_ms();

        if self.parent.is_shutting_down() {
            self.finish(Some(Error::ShuttingDown));
            return Step::Done;
        }

        if matches!(self.binding, Binding::Unbound) {
            let Some(mut guard) = self.topic_state.try_acquire() else {
                self.wait_expiration = (iteration_start + self.iterator_backoff_ms)
                    .min(self.started + self.request_timeout_ms);
                if iteration_start - self.started >= self.request_timeout_ms {
                    // Deadline lapsed while waiting for the iterator; the
                    // caller gets an empty (successful) response.
                    self.finish(None);
                    return Step::Done;
                }
                return Step::Busy;
            };
            if guard.is_none() {
                match self
                    .parent
                    .client()
                    .message_iterator(self.topic_state.topic())
                    .await
                {
                    Ok(iterator) => *guard = Some(PeekableIterator::new(iterator)),
                    Err(err) => {
                        drop(guard);
                        self.finish(Some(err));
                        return Step::Done;
                    }
                }
            }
            self.binding = Binding::Bound(guard);
        }

        let mut backoff = false;
        if !self.will_exceed_max_response_bytes && !self.exceeded_min_response_bytes {
            match self.pull_some().await {
                Ok(hit_empty) => backoff = hit_empty,
                Err(err) => {
                    self.finish(Some(err));
                    return Step::Done;
                }
            }
        }

        // Two time bases: the backoff anchors to the iteration's start (not
        // to now) so total elapsed tracks the request deadline exactly; the
        // deadline anchors to the task's creation.
        let backoff_expiration = iteration_start + self.iterator_backoff_ms;
        let request_expiration = self.started + self.request_timeout_ms;
        self.wait_expiration = backoff_expiration.min(request_expiration);

        let now = self.clock.now_ms();
        let request_timed_out = now.saturating_sub(self.started) >= self.request_timeout_ms;
        if request_timed_out
            || self.will_exceed_max_response_bytes
            || self.exceeded_min_response_bytes
        {
            self.finish(None);
            return Step::Done;
        }

        Step::Pending { backoff }
    }

    // Inner pull loop: peek, size, decide, and only then advance. A message
    // that would overflow the response stays in the peek slot for the next
    // read. Returns whether the loop ended on an empty bounded wait.
    async fn pull_some(&mut self) -> Result<bool, Error> {
        let Binding::Bound(guard) = &mut self.binding else {
            unreachable!("pull without a bound iterator")
        };
        let iterator = guard.as_mut().expect("bound task has an open iterator");
        let bounded_wait = Duration::from_millis(self.iterator_timeout_ms);

        loop {
            let Some(raw) = iterator.peek(bounded_wait).await? else {
                return Ok(true);
            };
            let (record, size) = self.parent.make_record(raw)?;

            if self.bytes_consumed + size >= self.max_response_bytes {
                self.will_exceed_max_response_bytes = true;
                return Ok(false);
            }

            iterator.advance();
            self.records.push(record);
            self.bytes_consumed += size;

            if self
                .response_min_bytes
                .is_some_and(|min| self.bytes_consumed > min)
            {
                self.exceeded_min_response_bytes = true;
                return Ok(false);
            }
        }
    }

    /// Terminal transition: update offsets on success, preserve the
    /// accumulation on failure, release the iterator, fire the callback.
    fn finish(&mut self, err: Option<Error>) {
        debug_assert!(!self.finished, "finish() must run exactly once");

        let records = std::mem::take(&mut self.records);
        let completion = match err {
            None => {
                // Offsets advance only on successful delivery.
                self.topic_state.record_delivered(&records);

                metrics::counter!("rekaf_records_read", "topic" => self.topic_state.topic().to_string())
                    .increment(records.len() as u64);
                metrics::counter!("rekaf_bytes_read", "topic" => self.topic_state.topic().to_string())
                    .increment(self.bytes_consumed as u64);
                tracing::debug!(
                    topic = self.topic_state.topic(),
                    count = records.len(),
                    bytes = self.bytes_consumed,
                    elapsed_ms = self.clock.now_ms().saturating_sub(self.started),
                    "completing read"
                );

                (Some(records), None)
            }
            Some(err) => {
                if !records.is_empty() {
                    self.topic_state.set_failed_read(FailedRead {
                        records,
                        bytes_consumed: self.bytes_consumed,
                        exceeded_min_response_bytes: self.exceeded_min_response_bytes,
                        will_exceed_max_response_bytes: self.will_exceed_max_response_bytes,
                    });
                }
                tracing::warn!(topic = self.topic_state.topic(), error = %err, "read failed");
                (None, Some(err))
            }
        };

        // Dropping the guard releases the topic's in-use flag.
        self.binding = Binding::Unbound;

        if let Some(callback) = self.callback.take() {
            let (records, err) = completion;
            complete(callback, records, err);
        }
        self.finished = true;
    }

    /// Retire the task without touching broker state, for pool shutdown.
    pub(crate) fn abort(&mut self) {
        self.finish(Some(Error::ShuttingDown));
    }
}

/// Fire a completion callback, containing any panic it raises: a throwing
/// callback must not unwind into the worker.
pub(crate) fn complete(
    callback: ReadCallback,
    records: Option<Vec<ConsumerRecord>>,
    err: Option<Error>,
) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(records, err))) {
        let panic = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "opaque panic payload".to_string());
        tracing::error!(panic = %panic, "read completion callback panicked");
    }
}
