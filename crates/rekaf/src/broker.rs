use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};

use crate::config::ConsumerOverrides;
use crate::error::Error;

/// One message as pulled from the broker, prior to format decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// Outcome of one bounded iterator poll. `Empty` — the bounded wait elapsed
/// with no message — is the common case, not an error.
pub enum Pull {
    Ready(RawMessage),
    Empty,
}

/// A broker iterator with a bounded per-poll wait.
#[async_trait::async_trait]
pub trait MessageIterator: Send {
    async fn pull(&mut self, bounded_wait: Duration) -> Result<Pull, Error>;
}

/// The broker connection owned by one consumer instance.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the instance's iterator over `topic`. Called lazily, at most
    /// once per topic state.
    async fn message_iterator(&self, topic: &str) -> Result<Box<dyn MessageIterator>, Error>;

    /// Synchronously commit the given offsets.
    async fn commit(&self, offsets: &[CommittedOffset]) -> Result<(), Error>;
}

/// Creates broker clients for newly registered consumer instances.
pub trait BrokerClientFactory: Send + Sync {
    fn create(
        &self,
        group: &str,
        instance_id: &str,
        overrides: &ConsumerOverrides,
    ) -> Result<Box<dyn BrokerClient>, Error>;
}

/// A `(topic, partition, offset)` triple as reported to commit callers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommittedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// One-slot lookahead over a [`MessageIterator`].
///
/// A message that was inspected but not accepted (it would overflow the
/// response) stays in the slot and is re-offered to the next read of the
/// same topic.
pub struct PeekableIterator {
    inner: Box<dyn MessageIterator>,
    slot: Option<RawMessage>,
}

impl PeekableIterator {
    pub fn new(inner: Box<dyn MessageIterator>) -> Self {
        Self { inner, slot: None }
    }

    /// Fill and expose the lookahead slot, waiting at most `bounded_wait`
    /// for the broker. `None` means the bounded wait elapsed.
    pub async fn peek(&mut self, bounded_wait: Duration) -> Result<Option<&RawMessage>, Error> {
        if self.slot.is_none() {
            match self.inner.pull(bounded_wait).await? {
                Pull::Ready(message) => self.slot = Some(message),
                Pull::Empty => return Ok(None),
            }
        }
        Ok(self.slot.as_ref())
    }

    /// Take the previously peeked message, advancing the iterator.
    pub fn advance(&mut self) -> RawMessage {
        self.slot.take().expect("advance() without a peeked message")
    }
}

/// [`BrokerClientFactory`] backed by rdkafka.
pub struct KafkaClientFactory {
    bootstrap_servers: String,
    auto_offset_reset: String,
}

impl KafkaClientFactory {
    pub fn new(bootstrap_servers: String, auto_offset_reset: String) -> Self {
        Self {
            bootstrap_servers,
            auto_offset_reset,
        }
    }
}

impl BrokerClientFactory for KafkaClientFactory {
    fn create(
        &self,
        group: &str,
        instance_id: &str,
        overrides: &ConsumerOverrides,
    ) -> Result<Box<dyn BrokerClient>, Error> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", group)
            .set("client.id", instance_id)
            // The proxy is the commit point: offsets advance only once a
            // read response is handed to the caller.
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("enable.partition.eof", "false");

        if let Some(timeout_ms) = overrides.request_timeout_ms {
            config.set("request.timeout.ms", timeout_ms.to_string());
        }

        let consumer: StreamConsumer = config.create().map_err(Error::BrokerInit)?;
        Ok(Box::new(KafkaBrokerClient {
            consumer: Arc::new(consumer),
        }))
    }
}

struct KafkaBrokerClient {
    consumer: Arc<StreamConsumer>,
}

#[async_trait::async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn message_iterator(&self, topic: &str) -> Result<Box<dyn MessageIterator>, Error> {
        self.consumer
            .subscribe(&[topic])
            .map_err(Error::BrokerInit)?;
        Ok(Box::new(KafkaIterator {
            consumer: self.consumer.clone(),
        }))
    }

    async fn commit(&self, offsets: &[CommittedOffset]) -> Result<(), Error> {
        let mut list = TopicPartitionList::new();
        for committed in offsets {
            list.add_partition_offset(
                &committed.topic,
                committed.partition,
                // Kafka commits name the next offset to consume.
                Offset::Offset(committed.offset + 1),
            )
            .map_err(Error::BrokerIo)?;
        }
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(Error::BrokerIo)
    }
}

struct KafkaIterator {
    consumer: Arc<StreamConsumer>,
}

#[async_trait::async_trait]
impl MessageIterator for KafkaIterator {
    async fn pull(&mut self, bounded_wait: Duration) -> Result<Pull, Error> {
        match tokio::time::timeout(bounded_wait, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Pull::Ready(RawMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|key| key.to_vec()),
                value: message.payload().map(|value| value.to_vec()),
            })),
            Ok(Err(err)) => Err(Error::BrokerIo(err)),
            Err(_) => Ok(Pull::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticIterator(Vec<RawMessage>);

    #[async_trait::async_trait]
    impl MessageIterator for StaticIterator {
        async fn pull(&mut self, _bounded_wait: Duration) -> Result<Pull, Error> {
            match self.0.pop() {
                Some(message) => Ok(Pull::Ready(message)),
                None => Ok(Pull::Empty),
            }
        }
    }

    #[tokio::test]
    async fn peek_is_idempotent_until_advanced() {
        let message = RawMessage {
            topic: "t".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            value: Some(b"v".to_vec()),
        };
        let mut iterator = PeekableIterator::new(Box::new(StaticIterator(vec![message])));

        let wait = Duration::from_millis(1);
        assert_eq!(iterator.peek(wait).await.unwrap().unwrap().offset, 7);
        assert_eq!(iterator.peek(wait).await.unwrap().unwrap().offset, 7);

        assert_eq!(iterator.advance().offset, 7);
        assert!(iterator.peek(wait).await.unwrap().is_none());
    }
}
