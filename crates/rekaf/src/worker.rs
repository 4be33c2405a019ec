use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::clock::Clock;
use crate::read::{ReadTask, Step};

// A task queued for its next wake time. Ordered by wake time, then by
// submission sequence, so tasks that are ready together dispatch FIFO and a
// re-queued task goes to the back of its wake slot.
struct Scheduled {
    wake_at: u64,
    seq: u64,
    task: ReadTask,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.wake_at, self.seq).cmp(&(other.wake_at, other.seq))
    }
}

struct Queue {
    tasks: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
}

struct Shared {
    clock: Arc<dyn Clock>,
    queue: Mutex<Queue>,
    notify: Notify,
    cancel: CancellationToken,
}

impl Shared {
    fn push(&self, task: ReadTask) {
        let mut queue = self.queue.lock().unwrap();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.tasks.push(Reverse(Scheduled {
            wake_at: task.wait_expiration(),
            seq,
            task,
        }));
        drop(queue);
        self.notify.notify_one();
    }
}

/// Multiplexes read tasks over a fixed pool of cooperative workers.
///
/// Each worker advances whichever task is due next and otherwise sleeps
/// until the nearest wake time, interruptibly by new submissions. Tasks
/// express their own pacing through `wait_expiration`; the pool never
/// re-runs a task before it.
pub struct ReadWorkerPool {
    shared: Arc<Shared>,
    // Aborting on drop keeps tests and shutdown from leaking workers.
    _workers: Vec<AbortOnDropHandle<()>>,
}

impl ReadWorkerPool {
    pub fn start(clock: Arc<dyn Clock>, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            clock,
            queue: Mutex::new(Queue {
                tasks: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
        });

        let workers = (0..workers.max(1))
            .map(|index| {
                let shared = shared.clone();
                AbortOnDropHandle::new(tokio::spawn(async move {
                    worker_loop(shared).await;
                    tracing::debug!(worker = index, "read worker stopped");
                }))
            })
            .collect();

        Self {
            shared,
            _workers: workers,
        }
    }

    /// Submit a read task; it is ready immediately.
    pub(crate) fn submit(&self, task: ReadTask) {
        self.shared.push(task);
    }

    /// Stop the workers. Queued tasks are retired with `ShuttingDown`.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.notify.notify_waiters();
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.cancel.is_cancelled() {
            drain(&shared);
            return;
        }

        let now = shared.clock.now_ms();
        let (due, next_wake) = {
            let mut queue = shared.queue.lock().unwrap();
            let next_wake = queue.tasks.peek().map(|Reverse(scheduled)| scheduled.wake_at);
            match next_wake {
                Some(wake_at) if wake_at <= now => {
                    (queue.tasks.pop().map(|Reverse(scheduled)| scheduled), None)
                }
                _ => (None, next_wake),
            }
        };

        match (due, next_wake) {
            (Some(mut scheduled), _) => match scheduled.task.do_partial_read().await {
                Step::Done => {}
                Step::Busy => shared.push(scheduled.task),
                Step::Pending { backoff } => {
                    if backoff {
                        metrics::counter!("rekaf_iterator_backoffs").increment(1);
                    }
                    shared.push(scheduled.task);
                }
            },
            (None, Some(wake_at)) => {
                tokio::select! {
                    _ = shared.clock.sleep_ms(wake_at - now) => {}
                    _ = shared.notify.notified() => {}
                }
            }
            (None, None) => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = shared.cancel.cancelled() => {}
                }
            }
        }
    }
}

fn drain(shared: &Shared) {
    let tasks = {
        let mut queue = shared.queue.lock().unwrap();
        std::mem::take(&mut queue.tasks)
    };
    for Reverse(mut scheduled) in tasks.into_vec() {
        scheduled.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(wake_at: u64, seq: u64) -> Reverse<(u64, u64)> {
        Reverse((wake_at, seq))
    }

    // The heap dispatches by wake time, FIFO within a wake slot; mirrors
    // the `Scheduled` ordering.
    #[test]
    fn ready_tasks_pop_in_fifo_order() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(50, 2));
        heap.push(entry(10, 1));
        heap.push(entry(10, 0));

        assert_eq!(heap.pop(), Some(entry(10, 0)));
        assert_eq!(heap.pop(), Some(entry(10, 1)));
        assert_eq!(heap.pop(), Some(entry(50, 2)));
    }
}
