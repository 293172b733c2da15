use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The query parameters of a request, kept in a stable order.
///
/// Parameters are ordered by name, so the order in which they were supplied does not
/// influence the resulting [`CacheKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<BTreeMap<String, String>> for Params {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Identifies one logical query: an endpoint together with its parameters.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    endpoint: Arc<str>,
    params: Params,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for querying `endpoint` with the given parameters.
    pub fn new(endpoint: &str, params: &Params) -> Self {
        let mut builder = Self::builder(endpoint);
        for (name, value) in params.iter() {
            builder.param(name, value);
        }
        builder.build()
    }

    /// Create a [`CacheKeyBuilder`] for the given endpoint, which parameters can be
    /// added to one by one.
    pub fn builder(endpoint: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            endpoint: endpoint.into(),
            params: Params::default(),
        }
    }

    /// The endpoint identifier this key was built for.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn endpoint_arc(&self) -> Arc<str> {
        Arc::clone(&self.endpoint)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let mut path = format!("v{version}/{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

/// A builder for [`CacheKey`]s.
///
/// Parameters are normalized before anything is hashed. The resulting metadata is human
/// readable, but most importantly **stable**, and is serialized alongside durable cache
/// files to help debugging.
pub struct CacheKeyBuilder {
    endpoint: String,
    params: Params,
}

impl CacheKeyBuilder {
    /// Adds a parameter, replacing an earlier value of the same name.
    pub fn param(&mut self, name: &str, value: &str) -> &mut Self {
        self.params.insert(name, value);
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        // debug-quoting keeps `=` and newlines inside the endpoint, names and values unambiguous
        let mut metadata = format!("endpoint: {:?}\n", self.endpoint);
        for (name, value) in self.params.iter() {
            let _ = writeln!(metadata, "{name:?}={value:?}");
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha256::digest(&metadata));

        CacheKey {
            endpoint: self.endpoint.into(),
            params: self.params,
            metadata: metadata.into(),
            hash,
        }
    }
}
