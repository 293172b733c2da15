use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "querycache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Defaults applied to every cached query, unless overridden per call.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Time after which a stored entry is considered stale.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Deadline for a single remote fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum number of entries kept in memory.
    ///
    /// A value of `None` indicates no limit.
    pub max_entries: Option<usize>,

    /// Serve stale entries immediately and refresh them in the background.
    pub revalidate: bool,

    /// Maximum age of a durable entry (item age) before it is deleted instead of
    /// being loaded as stale.
    #[serde(with = "humantime_serde")]
    pub max_stale_age: Option<Duration>,

    /// The window used to coalesce bursts of scheduled queries.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            timeout: crate::timeout::DEFAULT_TIMEOUT,
            max_entries: None,
            revalidate: false,
            max_stale_age: Some(Duration::from_secs(3600 * 24 * 7)),
            debounce: Duration::from_millis(300),
        }
    }
}

/// Per-call overrides of the configured [`CacheConfig`] defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// The TTL to store a successful result with.
    pub ttl: Option<Duration>,
    /// The deadline of the remote fetch.
    pub timeout: Option<Duration>,
    /// Whether a stale entry should be served while it is being refreshed.
    pub revalidate: Option<bool>,
}

impl FetchOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_revalidate(mut self, revalidate: bool) -> Self {
        self.revalidate = Some(revalidate);
        self
    }

    /// Fills in every unset option from the given defaults.
    pub fn resolve(&self, defaults: &CacheConfig) -> ResolvedOptions {
        ResolvedOptions {
            ttl: self.ttl.unwrap_or(defaults.ttl),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            revalidate: self.revalidate.unwrap_or(defaults.revalidate),
        }
    }
}

/// [`FetchOptions`] with all defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub ttl: Duration,
    pub timeout: Duration,
    pub revalidate: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. Default is not to cache across restarts.
    pub cache_dir: Option<PathBuf>,

    /// The analytics API that endpoints are resolved against.
    pub base_url: Option<Url>,

    /// Additional headers sent with every remote fetch.
    pub headers: BTreeMap<String, String>,

    /// Configuration of the logging system.
    pub logging: Logging,

    /// Configuration of the metrics system.
    pub metrics: Metrics,

    /// Defaults of the query cache.
    pub caches: CacheConfig,

    /// The timeout for establishing a connection to the analytics API.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no durable caching should
    /// happen and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            base_url: None,
            headers: BTreeMap::new(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            caches: CacheConfig::default(),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
