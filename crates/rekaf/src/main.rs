use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use rekaf::{ConsumerManager, KafkaClientFactory, MonotonicClock, ProxyConfig};

/// A REST proxy exposing long-lived Kafka consumer instances through
/// stateless HTTP reads.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Kafka bootstrap servers for consumer connections.
    #[arg(long, default_value = "localhost:9092", env = "BOOTSTRAP_SERVERS")]
    bootstrap_servers: String,
    /// Where a consumer group starts when it has no committed offsets.
    #[arg(long, default_value = "earliest", env = "AUTO_OFFSET_RESET")]
    auto_offset_reset: String,

    /// The port to listen on for consumer REST requests.
    #[arg(long, default_value = "8082", env = "HTTP_PORT")]
    http_port: u16,
    /// The port to listen on for prometheus metrics.
    #[arg(long, default_value = "8083", env = "METRICS_PORT")]
    metrics_port: u16,

    /// Deadline applied to each read request.
    #[arg(long, env = "FETCH_MAX_WAIT", value_parser = humantime::parse_duration, default_value = "1s")]
    fetch_max_wait: Duration,
    /// Response bytes above which a read returns early; negative disables
    /// the shortcut.
    #[arg(long, env = "FETCH_MIN_BYTES", default_value = "-1", allow_hyphen_values = true)]
    fetch_min_bytes: i64,
    /// Idle backoff between broker polls when the iterator is empty.
    #[arg(long, env = "ITERATOR_BACKOFF", value_parser = humantime::parse_duration, default_value = "50ms")]
    iterator_backoff: Duration,
    /// Bounded wait of a single broker poll.
    #[arg(long, env = "ITERATOR_TIMEOUT", value_parser = humantime::parse_duration, default_value = "1ms")]
    iterator_timeout: Duration,
    /// Server-side cap on response bytes per read.
    #[arg(long, env = "MAX_RESPONSE_BYTES", default_value = "67108864")]
    max_response_bytes: usize,
    /// Idle consumer instances are deleted after this long.
    #[arg(long, env = "INSTANCE_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5m")]
    instance_timeout: Duration,
    /// Number of cooperative read workers.
    #[arg(long, env = "CONSUMER_THREADS", default_value = "1")]
    consumer_threads: usize,
}

impl Cli {
    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            fetch_max_wait_ms: self.fetch_max_wait.as_millis() as u64,
            fetch_min_bytes: self.fetch_min_bytes,
            iterator_backoff_ms: self.iterator_backoff.as_millis() as u64,
            iterator_timeout_ms: self.iterator_timeout.as_millis() as u64,
            max_response_bytes: self.max_response_bytes,
            instance_timeout_ms: self.instance_timeout.as_millis() as u64,
            consumer_threads: self.consumer_threads,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    tracing::info!("starting rekaf");

    let clock = Arc::new(MonotonicClock::new());
    let factory = Box::new(KafkaClientFactory::new(
        cli.bootstrap_servers.clone(),
        cli.auto_offset_reset.clone(),
    ));
    let manager = ConsumerManager::new(cli.proxy_config(), clock, factory);

    let cancel_token = CancellationToken::new();

    // Listen for Ctrl+C and cancel the global cancellation token.
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        ctrl_c_token.cancel();
    });

    tokio::spawn(
        manager
            .clone()
            .run_expiration(cancel_token.child_token()),
    );

    let metrics_listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.metrics_port))
        .await
        .context("failed to bind metrics port")?;
    let metrics_router = rekaf::metrics_server::build_router();
    tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_router).await.unwrap()
    });

    let api_listener = tokio::net::TcpListener::bind(format!("[::]:{}", cli.http_port))
        .await
        .context("failed to bind server port")?;
    tracing::info!(port = cli.http_port, "serving consumer REST requests");

    let api_router = rekaf::api::build_router(manager.clone());
    axum::serve(api_listener, api_router)
        .with_graceful_shutdown(cancel_token.clone().cancelled_owned())
        .await
        .context("server error")?;

    manager.shutdown();
    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    tracing_subscriber::registry().with(fmt_layer).init();
}
