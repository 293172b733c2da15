use std::borrow::Cow;
use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

use querycache::caching::CacheStats;
use querycache::coordinator::FetchResult;
use querycache::errors::ClassifiedError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Writes the payload to stdout as is, and errors to stderr.
    Raw,
    /// Outputs every result as a single line of JSON.
    Json,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome<'a> {
    Ok {
        #[serde(with = "humantime_duration")]
        elapsed: Duration,
        payload: Cow<'a, str>,
    },
    Error {
        #[serde(with = "humantime_duration")]
        elapsed: Duration,
        error: &'a ClassifiedError,
    },
}

mod humantime_duration {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }
}

pub fn print_result(result: &FetchResult, format: OutputFormat, elapsed: Duration) -> Result<()> {
    match format {
        OutputFormat::Raw => match result {
            Ok(payload) => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(payload)?;
                if !payload.ends_with(b"\n") {
                    stdout.write_all(b"\n")?;
                }
            }
            Err(error) => eprintln!("{} ({}): {}", error.kind(), error.key(), error.message()),
        },
        OutputFormat::Json => {
            let outcome = match result {
                Ok(payload) => Outcome::Ok {
                    elapsed,
                    payload: String::from_utf8_lossy(payload),
                },
                Err(error) => Outcome::Error { elapsed, error },
            };
            println!("{}", serde_json::to_string(&outcome)?);
        }
    }
    Ok(())
}

pub fn print_stats(stats: &CacheStats) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}
