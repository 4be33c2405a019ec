#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("consumer instance not found")]
    NotFound,
    #[error("consumer is already subscribed to topic '{0}'")]
    AlreadySubscribed(String),
    #[error("consumer instance '{0}' already exists")]
    AlreadyExists(String),
    #[error("failed to open broker consumer")]
    BrokerInit(#[source] rdkafka::error::KafkaError),
    #[error("broker read failed")]
    BrokerIo(#[source] rdkafka::error::KafkaError),
    #[error("failed to decode message payload: {0}")]
    Decode(String),
    #[error("consumer instance is shutting down")]
    ShuttingDown,
}
