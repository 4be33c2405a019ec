use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerClientFactory, CommittedOffset};
use crate::clock::Clock;
use crate::config::{ConsumerOverrides, ProxyConfig, ReadSettings};
use crate::consumer::ConsumerState;
use crate::error::Error;
use crate::format::{ConsumerRecord, EmbeddedFormat};
use crate::read::{complete, ReadCallback, ReadTask};
use crate::worker::ReadWorkerPool;

/// Body of a consumer-creation request. A caller-supplied `id` wins over a
/// caller-supplied `name` (kept for backward compatibility); otherwise an
/// id is generated.
#[derive(Debug, Default, serde::Deserialize)]
pub struct CreateConsumerRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub format: EmbeddedFormat,
    #[serde(flatten)]
    pub overrides: ConsumerOverrides,
}

/// Registry of consumer instances and the entry point for reads, commits
/// and deletes.
pub struct ConsumerManager {
    config: ProxyConfig,
    clock: Arc<dyn Clock>,
    factory: Box<dyn BrokerClientFactory>,
    workers: ReadWorkerPool,
    instances: Mutex<HashMap<(String, String), Arc<ConsumerState>>>,
    next_instance_id: AtomicU64,
}

impl ConsumerManager {
    pub fn new(
        config: ProxyConfig,
        clock: Arc<dyn Clock>,
        factory: Box<dyn BrokerClientFactory>,
    ) -> Arc<Self> {
        let workers = ReadWorkerPool::start(clock.clone(), config.consumer_threads);
        Arc::new(Self {
            config,
            clock,
            factory,
            workers,
            instances: Mutex::new(HashMap::new()),
            next_instance_id: AtomicU64::new(1),
        })
    }

    /// Register a new instance within `group`, returning its id.
    pub fn create_consumer(
        &self,
        group: &str,
        request: CreateConsumerRequest,
    ) -> Result<String, Error> {
        let id = request
            .id
            .or(request.name)
            .unwrap_or_else(|| {
                format!(
                    "rest-consumer-{}",
                    self.next_instance_id.fetch_add(1, Ordering::Relaxed)
                )
            });

        let client = self.factory.create(group, &id, &request.overrides)?;
        let settings = ReadSettings::new(&self.config, &request.overrides);
        let instance = Arc::new(ConsumerState::new(
            group.to_string(),
            id.clone(),
            request.format,
            settings,
            client,
        ));
        instance.touch(self.clock.now_ms());

        let mut instances = self.instances.lock().unwrap();
        match instances.entry((group.to_string(), id.clone())) {
            std::collections::hash_map::Entry::Occupied(_) => {
                return Err(Error::AlreadyExists(id));
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(instance);
            }
        }
        drop(instances);

        tracing::info!(group, id = %id, "created consumer instance");
        Ok(id)
    }

    /// Submit one read against `topic`. The callback fires exactly once; a
    /// missing instance completes it synchronously with `NotFound`.
    pub fn read_topic(
        &self,
        group: &str,
        id: &str,
        topic: &str,
        max_bytes: Option<usize>,
        callback: ReadCallback,
    ) {
        let Some(instance) = self.instance(group, id) else {
            complete(callback, None, Some(Error::NotFound));
            return;
        };
        instance.touch(self.clock.now_ms());

        if let Some(task) = ReadTask::new(instance, self.clock.clone(), topic, max_bytes, callback)
        {
            self.workers.submit(task);
        }
    }

    /// Async wrapper over [`read_topic`](Self::read_topic) for HTTP callers.
    pub async fn read(
        &self,
        group: &str,
        id: &str,
        topic: &str,
        max_bytes: Option<usize>,
    ) -> Result<Vec<ConsumerRecord>, Error> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.read_topic(
            group,
            id,
            topic,
            max_bytes,
            Box::new(move |records, err| {
                let _ = tx.send((records, err));
            }),
        );

        match rx.await {
            Ok((Some(records), None)) => Ok(records),
            Ok((_, Some(err))) => Err(err),
            Ok((None, None)) => unreachable!("completion carries records or an error"),
            // The pool dropped the callback during shutdown.
            Err(_) => Err(Error::ShuttingDown),
        }
    }

    /// Snapshot and commit the instance's consumed offsets.
    pub async fn commit_offsets(
        &self,
        group: &str,
        id: &str,
    ) -> Result<Vec<CommittedOffset>, Error> {
        let instance = self.instance(group, id).ok_or(Error::NotFound)?;
        instance.touch(self.clock.now_ms());

        let offsets = instance.consumed_offsets();
        if !offsets.is_empty() {
            instance.client().commit(&offsets).await?;
        }
        tracing::debug!(group, id, count = offsets.len(), "committed offsets");
        Ok(offsets)
    }

    /// Delete the instance. In-flight reads finish with `ShuttingDown`; the
    /// broker connection closes once the last of them drains.
    pub fn delete_consumer(&self, group: &str, id: &str) -> Result<(), Error> {
        let instance = self
            .instances
            .lock()
            .unwrap()
            .remove(&(group.to_string(), id.to_string()))
            .ok_or(Error::NotFound)?;
        instance.shut_down();
        tracing::info!(group, id, "deleted consumer instance");
        Ok(())
    }

    /// Delete instances idle longer than `consumer.instance.timeout.ms`.
    /// Returns how many were expired.
    pub fn expire_idle(&self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<(String, String)> = {
            let instances = self.instances.lock().unwrap();
            instances
                .iter()
                .filter(|(_, instance)| {
                    now.saturating_sub(instance.last_activity_ms())
                        >= self.config.instance_timeout_ms
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        for (group, id) in &expired {
            tracing::info!(group = %group, id = %id, "expiring idle consumer instance");
            let _ = self.delete_consumer(group, id);
        }
        expired.len()
    }

    /// Periodically expire idle instances until cancelled.
    pub async fn run_expiration(self: Arc<Self>, cancel: CancellationToken) {
        let interval = (self.config.instance_timeout_ms / 2).max(1_000);
        loop {
            tokio::select! {
                _ = self.clock.sleep_ms(interval) => {}
                _ = cancel.cancelled() => return,
            }
            self.expire_idle();
        }
    }

    /// Stop the worker pool and mark every instance shutting down.
    pub fn shutdown(&self) {
        let instances = self.instances.lock().unwrap();
        for instance in instances.values() {
            instance.shut_down();
        }
        drop(instances);
        self.workers.shutdown();
    }

    fn instance(&self, group: &str, id: &str) -> Option<Arc<ConsumerState>> {
        self.instances
            .lock()
            .unwrap()
            .get(&(group.to_string(), id.to_string()))
            .cloned()
    }
}
