#[macro_use]
pub mod metrics;

pub mod caching;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod debounce;
pub mod errors;
pub mod fetcher;
pub mod logging;
pub mod revalidate;
pub mod service;
pub mod timeout;
pub mod utils;

#[cfg(test)]
#[allow(unused)]
mod test;
