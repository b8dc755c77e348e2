use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub backend_servers: Vec<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(with = "duration_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_write_timeout")]
    pub write_timeout: Duration,
    #[serde(with = "duration_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(with = "duration_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedResponseTime,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round-robin",
            Algorithm::LeastConnections => "least-connections",
            Algorithm::WeightedResponseTime => "weighted-response-time",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_write_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_port() -> u16 {
    9090
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addr.is_empty() {
            anyhow::bail!("server.listen_addr cannot be empty");
        }

        if !self.server.listen_addr.contains(':') {
            anyhow::bail!(
                "server.listen_addr must be host:port, got '{}'",
                self.server.listen_addr
            );
        }

        if self.load_balancer.health_check_interval.is_zero() {
            anyhow::bail!("load_balancer.health_check_interval cannot be zero");
        }

        for url_str in &self.backend_servers {
            let url = Url::parse(url_str)
                .with_context(|| format!("Invalid backend server URL: {}", url_str))?;

            if url.scheme() != "http" && url.scheme() != "https" {
                anyhow::bail!(
                    "Backend server URL must be http or https: {}",
                    url_str
                );
            }

            if url.host_str().is_none() {
                anyhow::bail!("Backend server URL has no host: {}", url_str);
            }
        }

        if self.tls.enabled {
            if self.tls.cert_file.is_empty() {
                anyhow::bail!("tls.cert_file cannot be empty when TLS is enabled");
            }
            if self.tls.key_file.is_empty() {
                anyhow::bail!("tls.key_file cannot be empty when TLS is enabled");
            }
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        // "ms" must be stripped before "s" and "m"
        if let Some(num) = s.strip_suffix("ms") {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_millis(num))
        } else if let Some(num) = s.strip_suffix('s') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num))
        } else if let Some(num) = s.strip_suffix('m') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            let num: u64 = num.trim().parse()?;
            Ok(Duration::from_secs(num * 3600))
        } else {
            let num: u64 = s.parse()?;
            Ok(Duration::from_secs(num))
        }
    }
}
