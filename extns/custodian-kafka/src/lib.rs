use std::collections::HashMap;

use rdkafka::config::ClientConfig;
use tracing::{info, warn};

pub mod sink;
pub mod source;

pub use source::{KafkaMessage, KafkaOffset, KafkaSource, KafkaSourceConfig};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Actor task terminated")]
    ActorTerminated,

    #[error("{0}")]
    Other(String),
}

/// SASL mechanisms supported when talking to the brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    fn as_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl TryFrom<&str> for SaslMechanism {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            other => Err(Error::Other(format!("Unsupported SASL mechanism: {other}"))),
        }
    }
}

/// Represents the SASL authentication used to connect to Kafka.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSaslAuth {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Applies the TLS and SASL settings shared by the consumer and the producer.
pub(crate) fn update_auth_config(
    client_config: &mut ClientConfig,
    tls_config: Option<TlsConfig>,
    auth: Option<KafkaSaslAuth>,
) {
    let protocol = match (&tls_config, &auth) {
        (None, None) => "PLAINTEXT",
        (Some(_), None) => "SSL",
        (None, Some(_)) => "SASL_PLAINTEXT",
        (Some(_), Some(_)) => "SASL_SSL",
    };
    client_config.set("security.protocol", protocol);

    if let Some(tls_config) = tls_config {
        if tls_config.insecure_skip_verify {
            warn!(
                "'insecure_skip_verify' is set to true, certificate validation will not be performed when connecting to Kafka server"
            );
            client_config
                .set("ssl.endpoint.identification.algorithm", "none")
                .set("enable.ssl.certificate.verification", "false");
        }
        if let Some(ca_cert) = tls_config.ca_cert {
            client_config.set("ssl.ca.pem", ca_cert);
        }
        if let Some(client_auth) = tls_config.client_auth {
            client_config
                .set("ssl.certificate.pem", client_auth.client_cert)
                .set("ssl.key.pem", client_auth.client_cert_private_key);
        }
    }

    if let Some(KafkaSaslAuth {
        mechanism,
        username,
        password,
    }) = auth
    {
        client_config
            .set("sasl.mechanisms", mechanism.as_str())
            .set("sasl.username", username)
            .set("sasl.password", password);
    }
}

/// Applies user-specified librdkafka options. Options managed by this crate are overwritten
/// afterwards by the caller.
pub(crate) fn apply_raw_config(client_config: &mut ClientConfig, raw: HashMap<String, String>) {
    if raw.is_empty() {
        return;
    }
    let mut entries: Vec<String> = raw.keys().map(|k| k.to_string()).collect();
    entries.sort();
    info!(keys = ?entries, "Applying user-specified kafka config");
    for (key, value) in raw {
        client_config.set(key, value);
    }
}
