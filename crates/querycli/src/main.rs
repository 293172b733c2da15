//! Querycli.
//!
//! Querycli runs analytics queries through the query cache from the command line. With a
//! `cache_dir` configured, cached results survive between invocations, which makes it useful to
//! inspect and prune a durable cache as well.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod output;

fn main() {
    match cli::execute() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            querycache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
