//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use url::Url;

use querycache::caching::{CacheKey, CacheStore, Params};
use querycache::clock::SystemClock;
use querycache::config::{Config, FetchOptions};
use querycache::fetcher::HttpFetcher;
use querycache::logging;
use querycache::metrics;
use querycache::service::QueryService;

use crate::output::{self, OutputFormat};

/// Querycli commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run a query, serving it from the cache when possible.
    Get(GetArgs),

    /// Drop cached queries from the durable cache.
    Invalidate(InvalidateArgs),

    /// Print a summary of the durable cache.
    Stats,
}

#[derive(Debug, Args)]
struct GetArgs {
    /// The endpoint to query, relative to the base URL.
    endpoint: String,

    /// Query parameters, as `name=value` pairs.
    #[arg(value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// How long the result stays fresh, e.g. `30s` or `5m`.
    #[arg(long, value_parser = humantime::parse_duration)]
    ttl: Option<Duration>,

    /// Give up on the remote API after this long.
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Serve a stale result right away and refresh it in the background.
    #[arg(long)]
    revalidate: bool,

    /// Run the query this many times in a row.
    #[arg(long, default_value_t = 1)]
    repeat: usize,

    /// The output format.
    #[arg(long, value_enum, default_value = "raw")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct InvalidateArgs {
    /// The endpoint to invalidate.
    #[arg(required_unless_present_any = ["prefix", "all"])]
    endpoint: Option<String>,

    /// Only invalidate the query with exactly these parameters, as `name=value` pairs.
    #[arg(value_parser = parse_param, requires = "endpoint")]
    params: Vec<(String, String)>,

    /// Invalidate every endpoint starting with this prefix.
    #[arg(long, conflicts_with_all = ["endpoint", "all"])]
    prefix: Option<String>,

    /// Invalidate the entire cache.
    #[arg(long, conflicts_with = "endpoint")]
    all: bool,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the base URL of the remote API.
    #[arg(long, global = true)]
    url: Option<Url>,

    /// Overrides the directory of the durable cache.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn parse_param(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => Err(format!("expected `name=value`, got `{arg}`")),
    }
}

/// Runs the main application and returns its exit code.
pub fn execute() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(url) = cli.url {
        config.base_url = Some(url);
    }
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = Some(cache_dir);
    }

    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(e) = metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        ) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to configure statsd"
            );
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("querycli")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Command::Get(args) => get(config, args).await,
            Command::Invalidate(args) => invalidate(config, args).await,
            Command::Stats => stats(config).await,
        }
    })
}

async fn get(config: Config, args: GetArgs) -> Result<i32> {
    let fetcher = HttpFetcher::from_config(&config).context("failed to set up the fetcher")?;
    let service = QueryService::from_config(&config, Arc::new(fetcher)).await;

    let params: Params = args.params.into_iter().collect();
    let mut options = FetchOptions::default();
    if let Some(ttl) = args.ttl {
        options = options.with_ttl(ttl);
    }
    if let Some(timeout) = args.timeout {
        options = options.with_timeout(timeout);
    }
    if args.revalidate {
        options = options.with_revalidate(true);
    }

    let mut failed = false;
    for _ in 0..args.repeat {
        let started = Instant::now();
        let result = service.get_or_fetch(&args.endpoint, &params, options).await;
        failed |= result.is_err();
        output::print_result(&result, args.format, started.elapsed())?;
    }

    service.wait_idle().await;
    tracing::debug!(stats = ?service.stats(), "Finished running queries");
    service.flush().await;

    Ok(if failed { 1 } else { 0 })
}

async fn open_store(config: &Config) -> Result<CacheStore> {
    if config.cache_dir.is_none() {
        anyhow::bail!("no cache_dir configured");
    }
    Ok(CacheStore::from_config(config, Arc::new(SystemClock)).await)
}

async fn invalidate(config: Config, args: InvalidateArgs) -> Result<i32> {
    let store = open_store(&config).await?;

    let removed = match (args.endpoint, args.prefix) {
        _ if args.all => store.invalidate_all(),
        (_, Some(prefix)) => store.invalidate_by_prefix(&prefix),
        (Some(endpoint), None) if args.params.is_empty() => store.invalidate_endpoint(&endpoint),
        (Some(endpoint), None) => {
            let params: Params = args.params.into_iter().collect();
            let key = CacheKey::new(&endpoint, &params);
            store.invalidate(&key) as usize
        }
        (None, None) => 0,
    };

    store.flush().await;
    println!("removed {removed} cached queries");
    Ok(0)
}

async fn stats(config: Config) -> Result<i32> {
    let store = open_store(&config).await?;
    output::print_stats(&store.stats())?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(
            parse_param("tf=30d"),
            Ok(("tf".to_owned(), "30d".to_owned()))
        );
        assert_eq!(
            parse_param("filter=a=b"),
            Ok(("filter".to_owned(), "a=b".to_owned()))
        );
        assert!(parse_param("tf").is_err());
        assert!(parse_param("=30d").is_err());
    }

    #[test]
    fn test_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "querycli", "get", "dashboard", "tf=30d", "--ttl", "5s", "--repeat", "2",
        ])
        .unwrap();
        let Command::Get(args) = cli.command else {
            panic!("expected get");
        };
        assert_eq!(args.endpoint, "dashboard");
        assert_eq!(args.params, vec![("tf".to_owned(), "30d".to_owned())]);
        assert_eq!(args.ttl, Some(Duration::from_secs(5)));
        assert_eq!(args.repeat, 2);

        assert!(Cli::try_parse_from(["querycli", "invalidate"]).is_err());
        assert!(Cli::try_parse_from(["querycli", "invalidate", "--all"]).is_ok());
    }
}
