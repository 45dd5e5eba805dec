use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::info;

use custodian_kafka::sink::KafkaSinkConfig;
use custodian_kafka::{
    KafkaSaslAuth, KafkaSourceConfig, SaslMechanism, TlsClientAuthCerts, TlsConfig,
};

use crate::{Error, Result};

const ENV_PREFIX: &str = "CUSTODIAN";
const ENV_CONFIG_FILE: &str = "CUSTODIAN_CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config/custodian.toml";

const DEFAULT_RETRY_DELAY_MS: u64 = 10_000;
const DEFAULT_DEAD_LETTER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_CONSUMER_GROUP: &str = "custodian";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Runtime settings. Loaded once at startup and handed to the components that need them.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Topic the records are consumed from.
    pub input_topic: String,
    /// Topic receiving the records that can not be stored.
    pub dead_letter_topic: String,
    /// Delay before a record is presented again after a transient failure, or after a failed
    /// dead-letter write.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound for the wait on the broker confirmation of a dead-letter write.
    #[serde(default = "default_dead_letter_timeout_ms")]
    pub dead_letter_timeout_ms: u64,
    /// How long a single read waits for a record before reporting that nothing arrived.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    pub kafka: KafkaSettings,
    pub postgres: PostgresSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaSettings {
    pub brokers: Vec<String>,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    pub auth: Option<SaslSettings>,
    pub tls: Option<TlsSettings>,
    /// Extra librdkafka options for the consumer.
    #[serde(default)]
    pub raw_config: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaslSettings {
    pub mechanism: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_cert_private_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_dead_letter_timeout_ms() -> u64 {
    DEFAULT_DEAD_LETTER_TIMEOUT_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_consumer_group() -> String {
    DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_acquire_timeout_secs() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_SECS
}

/// Environment variables override the file, `__` separates nested keys,
/// e.g. `CUSTODIAN_KAFKA__BROKERS=a:9092,b:9092`.
fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("kafka.brokers")
        .try_parsing(true)
}

impl Settings {
    /// Loads the settings from the optional config file and the `CUSTODIAN_*` environment.
    pub fn load() -> Result<Self> {
        let config_file = env::var(ENV_CONFIG_FILE).unwrap_or_else(|_| {
            info!(
                default = DEFAULT_CONFIG_FILE,
                "Config file is not specified, using the default"
            );
            DEFAULT_CONFIG_FILE.to_string()
        });

        Self::from_sources(
            File::from(Path::new(&config_file)).required(false),
            environment(),
        )
    }

    fn from_sources<S>(file: S, environment: Environment) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()
            .map_err(|e| Error::Config(format!("generating runtime configuration: {e}")))?
            .try_deserialize::<Self>()
            .map_err(|e| Error::Config(format!("parsing runtime configuration: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.input_topic.trim().is_empty() {
            return Err(Error::Config("input_topic must not be empty".to_string()));
        }
        if self.dead_letter_topic.trim().is_empty() {
            return Err(Error::Config(
                "dead_letter_topic must not be empty".to_string(),
            ));
        }
        if self.input_topic == self.dead_letter_topic {
            return Err(Error::Config(format!(
                "dead_letter_topic must differ from input_topic ({})",
                self.input_topic
            )));
        }
        if self.retry_delay_ms == 0 {
            return Err(Error::Config(
                "retry_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.dead_letter_timeout_ms == 0 {
            return Err(Error::Config(
                "dead_letter_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config(
                "kafka.brokers must contain at least one broker".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dead_letter_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_letter_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub(crate) fn source_config(&self) -> Result<KafkaSourceConfig> {
        Ok(KafkaSourceConfig {
            brokers: self.kafka.brokers.clone(),
            topic: self.input_topic.clone(),
            consumer_group: self.kafka.consumer_group.clone(),
            auth: self.kafka.sasl_auth()?,
            tls: self.kafka.tls_config(),
            kafka_raw_config: self.kafka.raw_config.clone(),
        })
    }

    pub(crate) fn dead_letter_config(&self) -> Result<KafkaSinkConfig> {
        Ok(KafkaSinkConfig {
            brokers: self.kafka.brokers.clone(),
            topic: self.dead_letter_topic.clone(),
            auth: self.kafka.sasl_auth()?,
            tls: self.kafka.tls_config(),
            delivery_timeout: self.dead_letter_timeout(),
        })
    }
}

impl KafkaSettings {
    fn sasl_auth(&self) -> Result<Option<KafkaSaslAuth>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let mechanism = SaslMechanism::try_from(auth.mechanism.as_str())
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Some(KafkaSaslAuth {
            mechanism,
            username: auth.username.clone(),
            password: auth.password.clone(),
        }))
    }

    fn tls_config(&self) -> Option<TlsConfig> {
        let tls = self.tls.as_ref()?;
        let client_auth = match (&tls.client_cert, &tls.client_cert_private_key) {
            (Some(client_cert), Some(key)) => Some(TlsClientAuthCerts {
                client_cert: client_cert.clone(),
                client_cert_private_key: key.clone(),
            }),
            _ => None,
        };
        Some(TlsConfig {
            insecure_skip_verify: tls.insecure_skip_verify,
            ca_cert: tls.ca_cert.clone(),
            client_auth,
        })
    }
}
