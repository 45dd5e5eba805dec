//! Custodian consumes customer records from a Kafka topic and stores them in Postgres. A record
//! that can not be stored is either redelivered (the store is unreachable) or forwarded to a
//! dead-letter topic, a record is committed only once its fate is durable.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use self::config::Settings;
pub use self::error::{Error, Result};

mod error;

/// Runtime settings, loaded from the config file and the environment.
pub mod config;

/// Acknowledgement of the processed records.
mod ack;
/// Decides how a failed processing attempt is handled.
mod classifier;
/// The loop driving every record to exactly one acknowledgement.
mod consumer;
/// Forwarding of the records that can not be stored.
mod dead_letter;
mod message;
mod source;
mod store;

#[cfg(test)]
mod test_utils;

use crate::consumer::Consumer;
use crate::dead_letter::DeadLetterForwarder;
use crate::source::kafka::new_kafka_source;
use crate::store::postgres::PostgresGateway;

/// Connects to Kafka and Postgres and consumes until SIGINT or SIGTERM.
pub async fn run(settings: Settings) -> Result<()> {
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = start_consumer(cln_token, &settings).await;
    if let Err(e) = &result {
        error!("Application error: {:?}", e);
    }

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    info!("Gracefully Exiting...");
    result
}

async fn start_consumer(cln_token: CancellationToken, settings: &Settings) -> Result<()> {
    info!(
        input_topic = %settings.input_topic,
        dead_letter_topic = %settings.dead_letter_topic,
        retry_delay = ?settings.retry_delay(),
        "Starting custodian"
    );

    let source = new_kafka_source(settings.source_config()?, settings.read_timeout()).await?;

    let dead_letter_sink = custodian_kafka::sink::new_sink(settings.dead_letter_config()?)
        .map_err(|e| Error::DeadLetter(format!("Failed to create dead-letter producer: {e}")))?;
    let forwarder = DeadLetterForwarder::new(
        dead_letter_sink,
        settings.dead_letter_topic.as_str(),
        settings.dead_letter_timeout(),
    );

    let gateway = PostgresGateway::connect(&settings.postgres).await?;
    gateway.ensure_schema().await?;

    Consumer::new(
        source.clone(),
        source,
        gateway,
        forwarder,
        settings.retry_delay(),
    )
    .run(cln_token)
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
