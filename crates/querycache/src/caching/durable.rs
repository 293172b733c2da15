//! The durable tier of the cache, which survives process restarts.
//!
//! Every entry is stored as two files below `<cache_dir>/entries`: the raw payload at
//! [`CacheKey::cache_path`], and a JSON `.metadata` sidecar right next to it that holds
//! everything needed to rebuild the in-memory [`CacheEntry`].

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{CacheEntry, CacheKey, Params};

/// The version of the on-disk format.
///
/// Bumping this will make all previously written entries invisible.
pub const DURABLE_VERSION: u32 = 1;

const METADATA_EXTENSION: &str = "metadata";

/// Everything about a durable entry except for its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub endpoint: String,
    pub params: Params,
    pub stored_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// A [`CacheEntry`] in the form it is handed to [`DurableStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedEntry {
    pub metadata: EntryMetadata,
    pub payload: Bytes,
}

impl SerializedEntry {
    pub fn new(key: &CacheKey, entry: &CacheEntry) -> Self {
        Self {
            metadata: EntryMetadata {
                endpoint: key.endpoint().to_owned(),
                params: key.params().clone(),
                stored_at: entry.stored_at.into(),
                ttl: entry.ttl,
            },
            payload: entry.value.clone(),
        }
    }

    /// Rebuilds the [`CacheKey`] this entry was stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.metadata.endpoint, &self.metadata.params)
    }

    pub fn into_entry(self) -> (CacheKey, CacheEntry) {
        let key = self.key();
        let entry = CacheEntry {
            value: self.payload,
            stored_at: SystemTime::from(self.metadata.stored_at),
            ttl: self.metadata.ttl,
        };
        (key, entry)
    }
}

/// Persistent storage backing the in-memory cache.
///
/// All methods are blocking and are called off the async runtime. Failures are reported to the
/// caller, which logs them and carries on.
pub trait DurableStorage: fmt::Debug + Send + Sync + 'static {
    /// Reads a single entry.
    fn read(&self, key: &CacheKey) -> io::Result<Option<SerializedEntry>>;

    /// Writes an entry, replacing any earlier entry with the same key.
    fn write(&self, key: &CacheKey, entry: &SerializedEntry) -> io::Result<()>;

    /// Removes an entry, succeeding if it does not exist.
    fn remove(&self, key: &CacheKey) -> io::Result<()>;

    /// Removes all entries.
    fn clear(&self) -> io::Result<()>;

    /// Reads all entries that can be read.
    ///
    /// Entries that are unreadable are dropped from the storage.
    fn load_all(&self) -> io::Result<Vec<SerializedEntry>>;
}

/// [`DurableStorage`] on the local file system.
#[derive(Debug, Clone)]
pub struct FsStorage {
    /// Directory holding all entries.
    entries_dir: PathBuf,
    /// Directory for files that are still being written.
    ///
    /// Files are fully written here and then atomically moved into the
    /// [`entries_dir`](Self::entries_dir), so readers never observe partial writes.
    tmp_dir: PathBuf,
}

impl FsStorage {
    pub fn new(cache_dir: &Path) -> io::Result<Self> {
        let entries_dir = cache_dir.join("entries");
        let tmp_dir = cache_dir.join("tmp");
        fs::create_dir_all(&entries_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            entries_dir,
            tmp_dir,
        })
    }

    pub fn entries_dir(&self) -> &Path {
        &self.entries_dir
    }

    /// Removes leftovers of writes that were interrupted.
    pub fn clear_tmp(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.tmp_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir.join(key.cache_path(DURABLE_VERSION))
    }

    fn tempfile(&self) -> io::Result<NamedTempFile> {
        fs::create_dir_all(&self.tmp_dir)?;
        tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)
    }

    fn read_path(&self, path: &Path) -> io::Result<Option<SerializedEntry>> {
        let metadata = match catch_not_found(|| fs::read(metadata_path(path)))? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let metadata: EntryMetadata = serde_json::from_slice(&metadata)?;

        Ok(catch_not_found(|| fs::read(path))?.map(|payload| SerializedEntry {
            metadata,
            payload: payload.into(),
        }))
    }

    fn remove_path(path: &Path) -> io::Result<()> {
        catch_not_found(|| fs::remove_file(path))?;
        catch_not_found(|| fs::remove_file(metadata_path(path)))?;
        Ok(())
    }

    fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
        let entries = match catch_not_found(|| fs::read_dir(dir))? {
            Some(entries) => entries,
            None => return Ok(()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect_files(&path, files)?;
            } else if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXTENSION) {
                files.push(path);
            }
        }
        Ok(())
    }
}

impl DurableStorage for FsStorage {
    fn read(&self, key: &CacheKey) -> io::Result<Option<SerializedEntry>> {
        self.read_path(&self.entry_path(key))
    }

    fn write(&self, key: &CacheKey, entry: &SerializedEntry) -> io::Result<()> {
        let path = self.entry_path(key);

        let mut payload_file = self.tempfile()?;
        payload_file.write_all(&entry.payload)?;
        persist_tempfile(payload_file, &path)?;

        let mut metadata_file = self.tempfile()?;
        serde_json::to_writer(&mut metadata_file, &entry.metadata)?;
        persist_tempfile(metadata_file, &metadata_path(&path))?;

        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> io::Result<()> {
        Self::remove_path(&self.entry_path(key))
    }

    fn clear(&self) -> io::Result<()> {
        let dir = self.entries_dir.join(format!("v{DURABLE_VERSION}"));
        catch_not_found(|| fs::remove_dir_all(&dir))?;
        Ok(())
    }

    fn load_all(&self) -> io::Result<Vec<SerializedEntry>> {
        let mut files = vec![];
        Self::collect_files(&self.entries_dir.join(format!("v{DURABLE_VERSION}")), &mut files)?;

        let mut entries = Vec::with_capacity(files.len());
        for path in files {
            match self.read_path(&path) {
                Ok(Some(entry)) => {
                    entries.push(entry);
                    continue;
                }
                Ok(None) => {
                    tracing::debug!(path = %path.display(), "Removing durable entry without metadata");
                }
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Removing corrupt durable entry",
                    );
                }
            }

            if let Err(e) = Self::remove_path(&path) {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to remove durable entry",
                );
            }
        }

        Ok(entries)
    }
}

fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension(METADATA_EXTENSION)
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // A concurrent `clear` could remove the parent directories we are operating in,
    // so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(path = %path.display(), "Failed to persist cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(endpoint: &str, payload: &'static [u8]) -> (CacheKey, SerializedEntry) {
        let key = CacheKey::new(endpoint, &[("tf", "30d")].into());
        let entry = CacheEntry {
            value: Bytes::from_static(payload),
            stored_at: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            ttl: Duration::from_secs(5),
        };
        let serialized = SerializedEntry::new(&key, &entry);
        (key, serialized)
    }

    #[test]
    fn test_write_read_remove() {
        let dir = querycache_test::tempdir();
        let storage = FsStorage::new(dir.path()).unwrap();
        let (key, serialized) = entry("dashboard", b"{\"visits\":1}");

        assert_eq!(storage.read(&key).unwrap(), None);

        storage.write(&key, &serialized).unwrap();
        assert_eq!(storage.read(&key).unwrap(), Some(serialized.clone()));

        let path = storage.entry_path(&key);
        assert!(path.starts_with(dir.path().join("entries").join("v1")));
        assert!(metadata_path(&path).exists());

        storage.remove(&key).unwrap();
        assert_eq!(storage.read(&key).unwrap(), None);
        assert!(!metadata_path(&path).exists());

        // removing twice is fine
        storage.remove(&key).unwrap();
    }

    #[test]
    fn test_into_entry() {
        let (key, serialized) = entry("dashboard", b"payload");
        let (rebuilt, entry) = serialized.clone().into_entry();

        assert_eq!(rebuilt, key);
        assert_eq!(entry.value, serialized.payload);
        assert_eq!(entry.ttl, Duration::from_secs(5));
        assert_eq!(SystemTime::from(serialized.metadata.stored_at), entry.stored_at);
    }

    #[test]
    fn test_metadata_format() {
        let (_key, serialized) = entry("dashboard", b"payload");
        let json = serde_json::to_string_pretty(&serialized.metadata).unwrap();

        insta::assert_snapshot!(json, @r###"
        {
          "endpoint": "dashboard",
          "params": {
            "tf": "30d"
          },
          "stored_at": "2023-11-14T22:13:20Z",
          "ttl": "5s"
        }
        "###);
    }

    #[test]
    fn test_load_all_drops_corrupt_entries() {
        let dir = querycache_test::tempdir();
        let storage = FsStorage::new(dir.path()).unwrap();

        let (a, a_entry) = entry("dashboard", b"a");
        let (b, b_entry) = entry("funnels", b"b");
        storage.write(&a, &a_entry).unwrap();
        storage.write(&b, &b_entry).unwrap();

        // corrupt metadata
        let b_path = storage.entry_path(&b);
        fs::write(metadata_path(&b_path), b"{not json").unwrap();

        // payload without metadata
        let orphan = storage.entries_dir().join("v1/00/000000/orphan");
        fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        fs::write(&orphan, b"orphan").unwrap();

        let loaded = storage.load_all().unwrap();
        assert_eq!(loaded, vec![a_entry]);

        assert!(!b_path.exists());
        assert!(!orphan.exists());
    }

    #[test]
    fn test_load_all_survives_failed_removal() {
        let dir = querycache_test::tempdir();
        let storage = FsStorage::new(dir.path()).unwrap();

        let (a, a_entry) = entry("dashboard", b"a");
        let (b, b_entry) = entry("funnels", b"b");
        storage.write(&a, &a_entry).unwrap();
        storage.write(&b, &b_entry).unwrap();

        // a directory in place of the metadata can be neither read nor removed as a file
        let broken = storage.entries_dir().join("v1/00/000000/broken");
        fs::create_dir_all(metadata_path(&broken)).unwrap();
        fs::write(&broken, b"broken").unwrap();

        let mut loaded = storage.load_all().unwrap();
        loaded.sort_by(|x, y| x.metadata.endpoint.cmp(&y.metadata.endpoint));
        assert_eq!(loaded, vec![a_entry, b_entry]);
        assert!(metadata_path(&broken).is_dir());
    }

    #[test]
    fn test_clear() {
        let dir = querycache_test::tempdir();
        let storage = FsStorage::new(dir.path()).unwrap();
        let (key, serialized) = entry("dashboard", b"a");
        storage.write(&key, &serialized).unwrap();

        storage.clear().unwrap();
        assert_eq!(storage.read(&key).unwrap(), None);
        assert!(storage.load_all().unwrap().is_empty());

        // writing after a clear recreates the directories
        storage.write(&key, &serialized).unwrap();
        assert_eq!(storage.read(&key).unwrap(), Some(serialized));
    }

    #[test]
    fn test_clear_tmp() {
        let dir = querycache_test::tempdir();
        let storage = FsStorage::new(dir.path()).unwrap();
        let leftover = dir.path().join("tmp").join("tmpabc");
        fs::write(&leftover, b"half written").unwrap();

        storage.clear_tmp().unwrap();
        assert!(!leftover.exists());
        assert!(dir.path().join("tmp").is_dir());
    }
}
