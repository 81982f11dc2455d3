use std::net::SocketAddr;
use std::sync::Arc;
use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::consumer::ConsumerOptions;
use crate::kafka::KafkaConfig;
use crate::query::QueryLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub kafka_brokers: Arc<str>,
    pub kafka_topic: Arc<str>,
    pub kafka_group_id: Arc<str>,
    pub kafka_connect_timeout_secs: u64,
    pub es_url: Arc<str>,
    pub es_user: Arc<str>,
    pub es_pass: Arc<str>,
    pub index_name: Arc<str>,
    pub redis_url: Arc<str>,
    pub latest_key: Arc<str>,
    pub latest_capacity: usize,
    pub latest_read_limit: usize,
    pub error_key_prefix: Arc<str>,
    pub error_ttl_secs: u64,
    pub search_default_size: usize,
    pub search_max_size: usize,
    pub listen_addr: SocketAddr,
    pub http_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub partition_buffer: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    kafka_brokers: String,
    kafka_topic: String,
    kafka_group_id: String,
    kafka_connect_timeout_secs: u64,
    es_url: String,
    es_user: String,
    es_pass: String,
    index_name: String,
    redis_url: String,
    latest_key: String,
    latest_capacity: usize,
    latest_read_limit: usize,
    error_key_prefix: String,
    error_ttl_secs: u64,
    search_default_size: usize,
    search_max_size: usize,
    listen_addr: SocketAddr,
    http_timeout_secs: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    partition_buffer: usize,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            kafka_brokers: "localhost:9092".into(),
            kafka_topic: "logs".into(),
            kafka_group_id: "logs-consumer-group".into(),
            kafka_connect_timeout_secs: 10,
            es_url: "http://localhost:9200".into(),
            es_user: String::new(),
            es_pass: String::new(),
            index_name: "logs".into(),
            redis_url: "redis://localhost:6379".into(),
            latest_key: "latest_logs".into(),
            latest_capacity: 100,
            latest_read_limit: 50,
            error_key_prefix: "errors".into(),
            error_ttl_secs: 60 * 60 * 48,
            search_default_size: 20,
            search_max_size: 10_000,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            http_timeout_secs: 30,
            backoff_base_ms: 200,
            backoff_max_ms: 10_000,
            partition_buffer: 64,
        }
    }
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Self {
            kafka_brokers: raw.kafka_brokers.into(),
            kafka_topic: raw.kafka_topic.into(),
            kafka_group_id: raw.kafka_group_id.into(),
            kafka_connect_timeout_secs: raw.kafka_connect_timeout_secs,
            es_url: raw.es_url.into(),
            es_user: raw.es_user.into(),
            es_pass: raw.es_pass.into(),
            index_name: raw.index_name.into(),
            redis_url: raw.redis_url.into(),
            latest_key: raw.latest_key.into(),
            latest_capacity: raw.latest_capacity,
            latest_read_limit: raw.latest_read_limit,
            error_key_prefix: raw.error_key_prefix.into(),
            error_ttl_secs: raw.error_ttl_secs,
            search_default_size: raw.search_default_size,
            search_max_size: raw.search_max_size,
            listen_addr: raw.listen_addr,
            http_timeout_secs: raw.http_timeout_secs,
            backoff_base_ms: raw.backoff_base_ms,
            backoff_max_ms: raw.backoff_max_ms,
            partition_buffer: raw.partition_buffer,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

impl Config {
    /// Explicit file, else the per-user config file if present, else defaults;
    /// then environment overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env()?;
        validate(&cfg)?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(raw).context("parsing config toml")?;
        Ok(raw.into())
    }

    fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    fn apply_env(&mut self) -> Result<()> {
        maybe_env_str(&mut self.kafka_brokers, "KAFKA_BROKER");
        maybe_env_str(&mut self.kafka_topic, "KAFKA_TOPIC");
        maybe_env_str(&mut self.kafka_group_id, "KAFKA_GROUP_ID");
        maybe_env_u64(&mut self.kafka_connect_timeout_secs, "KAFKA_CONNECT_TIMEOUT_SECS");
        maybe_env_str(&mut self.es_url, "ELASTICSEARCH_URL");
        maybe_env_str(&mut self.es_user, "ES_USER");
        maybe_env_str(&mut self.es_pass, "ES_PASS");
        maybe_env_str(&mut self.index_name, "INDEX_NAME");
        maybe_env_str(&mut self.redis_url, "REDIS_URL");
        maybe_env_str(&mut self.latest_key, "LATEST_KEY");
        maybe_env_usize(&mut self.latest_capacity, "LATEST_CAPACITY");
        maybe_env_usize(&mut self.latest_read_limit, "LATEST_READ_LIMIT");
        maybe_env_str(&mut self.error_key_prefix, "ERROR_KEY_PREFIX");
        maybe_env_u64(&mut self.error_ttl_secs, "ERROR_TTL_SECS");
        maybe_env_usize(&mut self.search_default_size, "SEARCH_DEFAULT_SIZE");
        maybe_env_u64(&mut self.http_timeout_secs, "HTTP_TIMEOUT_SECS");
        maybe_env_u64(&mut self.backoff_base_ms, "BACKOFF_BASE_MS");
        maybe_env_u64(&mut self.backoff_max_ms, "BACKOFF_MAX_MS");
        maybe_env_usize(&mut self.partition_buffer, "PARTITION_BUFFER");

        if let Ok(addr) = env::var("LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .with_context(|| format!("invalid LISTEN_ADDR {addr:?}"))?;
        }
        if let Ok(port) = env::var("SERVICE_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("invalid SERVICE_PORT {port:?}"))?;
            self.listen_addr.set_port(port);
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn error_ttl(&self) -> Duration {
        Duration::from_secs(self.error_ttl_secs)
    }

    pub fn kafka(&self) -> KafkaConfig {
        KafkaConfig {
            brokers: self.kafka_brokers.clone(),
            topic: self.kafka_topic.clone(),
            group_id: self.kafka_group_id.clone(),
            connect_timeout: Duration::from_secs(self.kafka_connect_timeout_secs),
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            partition_buffer: self.partition_buffer,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            search_default_size: self.search_default_size,
            search_max_size: self.search_max_size,
            latest_limit: self.latest_read_limit,
        }
    }
}

fn default_config_path() -> PathBuf {
    ProjectDirs::from("com", "logtrail", "logtrail")
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".logtrail"))
        .join("config.toml")
}

fn validate(cfg: &Config) -> Result<()> {
    let required = [
        ("KAFKA_BROKER", &cfg.kafka_brokers),
        ("KAFKA_TOPIC", &cfg.kafka_topic),
        ("KAFKA_GROUP_ID", &cfg.kafka_group_id),
        ("ELASTICSEARCH_URL", &cfg.es_url),
        ("INDEX_NAME", &cfg.index_name),
        ("REDIS_URL", &cfg.redis_url),
        ("LATEST_KEY", &cfg.latest_key),
        ("ERROR_KEY_PREFIX", &cfg.error_key_prefix),
    ];
    for (key, value) in required {
        if value.trim().is_empty() {
            anyhow::bail!("{key} must not be empty");
        }
    }
    if cfg.kafka_connect_timeout_secs == 0 {
        anyhow::bail!("KAFKA_CONNECT_TIMEOUT_SECS must be > 0");
    }
    if cfg.latest_capacity == 0 {
        anyhow::bail!("LATEST_CAPACITY must be > 0");
    }
    if cfg.latest_read_limit == 0 {
        anyhow::bail!("LATEST_READ_LIMIT must be > 0");
    }
    if cfg.error_ttl_secs == 0 {
        anyhow::bail!("ERROR_TTL_SECS must be > 0");
    }
    if cfg.backoff_base_ms == 0 {
        anyhow::bail!("BACKOFF_BASE_MS must be > 0");
    }
    if cfg.backoff_max_ms < cfg.backoff_base_ms {
        anyhow::bail!(
            "BACKOFF_MAX_MS ({}) must be >= BACKOFF_BASE_MS ({})",
            cfg.backoff_max_ms,
            cfg.backoff_base_ms
        );
    }
    if cfg.search_max_size == 0 {
        anyhow::bail!("search_max_size must be > 0");
    }
    Ok(())
}

fn maybe_env_str(val: &mut Arc<str>, key: &str) {
    if let Ok(v) = env::var(key) {
        if !v.trim().is_empty() {
            *val = v.into();
        }
    }
}

fn maybe_env_usize(val: &mut usize, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(n) = v.parse::<usize>() {
            *val = n;
        }
    }
}

fn maybe_env_u64(val: &mut u64, key: &str) {
    if let Ok(v) = env::var(key) {
        if let Ok(n) = v.parse::<u64>() {
            *val = n;
        }
    }
}
