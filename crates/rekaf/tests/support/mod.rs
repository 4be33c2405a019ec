use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rekaf::{
    BrokerClient, BrokerClientFactory, CommittedOffset, ConsumerManager, ConsumerOverrides,
    ConsumerRecord, CreateConsumerRequest, EmbeddedFormat, Error, MessageIterator, ProxyConfig,
    Pull, RawMessage, VirtualClock,
};

/// One scripted broker outcome, in delivery order. Once the script drains,
/// every pull comes up empty after its bounded wait.
pub enum ScriptStep {
    Message(RawMessage),
    Fail,
}

pub fn message(partition: i32, offset: i64, value: &str) -> ScriptStep {
    ScriptStep::Message(RawMessage {
        topic: "events".to_string(),
        partition,
        offset,
        key: None,
        value: Some(value.as_bytes().to_vec()),
    })
}

pub fn broker_failure() -> Error {
    Error::BrokerIo(rdkafka::error::KafkaError::MessageConsumption(
        rdkafka::types::RDKafkaErrorCode::BrokerTransportFailure,
    ))
}

pub fn init_failure() -> Error {
    Error::BrokerInit(rdkafka::error::KafkaError::ClientCreation(
        "scripted iterator open failure".to_string(),
    ))
}

type Script = Arc<Mutex<VecDeque<ScriptStep>>>;

struct ScriptedFactory {
    clock: Arc<VirtualClock>,
    script: Script,
    commits: Arc<Mutex<Vec<CommittedOffset>>>,
    fail_open: Arc<AtomicBool>,
}

impl BrokerClientFactory for ScriptedFactory {
    fn create(
        &self,
        _group: &str,
        _instance_id: &str,
        _overrides: &ConsumerOverrides,
    ) -> Result<Box<dyn BrokerClient>, Error> {
        Ok(Box::new(ScriptedClient {
            clock: self.clock.clone(),
            script: self.script.clone(),
            commits: self.commits.clone(),
            fail_open: self.fail_open.clone(),
        }))
    }
}

struct ScriptedClient {
    clock: Arc<VirtualClock>,
    script: Script,
    commits: Arc<Mutex<Vec<CommittedOffset>>>,
    fail_open: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl BrokerClient for ScriptedClient {
    async fn message_iterator(&self, _topic: &str) -> Result<Box<dyn MessageIterator>, Error> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(init_failure());
        }
        Ok(Box::new(ScriptedIterator {
            clock: self.clock.clone(),
            script: self.script.clone(),
        }))
    }

    async fn commit(&self, offsets: &[CommittedOffset]) -> Result<(), Error> {
        self.commits.lock().unwrap().extend_from_slice(offsets);
        Ok(())
    }
}

// A deterministic iterator: pulls pop the script, and an empty script
// consumes the bounded wait from the virtual clock, exactly like a real
// broker iterator timing out.
struct ScriptedIterator {
    clock: Arc<VirtualClock>,
    script: Script,
}

#[async_trait::async_trait]
impl MessageIterator for ScriptedIterator {
    async fn pull(&mut self, bounded_wait: Duration) -> Result<Pull, Error> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Message(message)) => Ok(Pull::Ready(message)),
            Some(ScriptStep::Fail) => Err(broker_failure()),
            None => {
                self.clock.advance_ms(bounded_wait.as_millis() as u64);
                Ok(Pull::Empty)
            }
        }
    }
}

/// A proxy wired to a virtual clock, a scripted broker, and one worker.
pub struct TestProxy {
    pub clock: Arc<VirtualClock>,
    pub manager: Arc<ConsumerManager>,
    script: Script,
    pub commits: Arc<Mutex<Vec<CommittedOffset>>>,
    fail_open: Arc<AtomicBool>,
}

pub const GROUP: &str = "test-group";

pub fn proxy(config: ProxyConfig) -> TestProxy {
    let clock = Arc::new(VirtualClock::new());
    let script: Script = Arc::new(Mutex::new(VecDeque::new()));
    let commits = Arc::new(Mutex::new(Vec::new()));
    let fail_open = Arc::new(AtomicBool::new(false));
    let factory = Box::new(ScriptedFactory {
        clock: clock.clone(),
        script: script.clone(),
        commits: commits.clone(),
        fail_open: fail_open.clone(),
    });
    let manager = ConsumerManager::new(config, clock.clone(), factory);
    TestProxy {
        clock,
        manager,
        script,
        commits,
        fail_open,
    }
}

/// A config whose timings are easy to do arithmetic on in assertions.
pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        fetch_max_wait_ms: 1_000,
        fetch_min_bytes: -1,
        iterator_backoff_ms: 50,
        iterator_timeout_ms: 1,
        max_response_bytes: 64 << 20,
        instance_timeout_ms: 300_000,
        consumer_threads: 1,
    }
}

impl TestProxy {
    pub fn push(&self, steps: Vec<ScriptStep>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Make iterator opens fail with `BrokerInit` until switched back.
    pub fn fail_iterator_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn create(&self, format: EmbeddedFormat, overrides: ConsumerOverrides) -> String {
        self.manager
            .create_consumer(
                GROUP,
                CreateConsumerRequest {
                    id: None,
                    name: None,
                    format,
                    overrides,
                },
            )
            .expect("create consumer")
    }

    pub async fn read(
        &self,
        id: &str,
        topic: &str,
        max_bytes: Option<usize>,
    ) -> Result<Vec<ConsumerRecord>, Error> {
        self.manager.read(GROUP, id, topic, max_bytes).await
    }
}
