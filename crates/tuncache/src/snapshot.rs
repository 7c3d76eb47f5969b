//! Snapshot persistence for [`RegistryCache`]
//!
//! Stream layout:
//! ```text
//! TUNREG\n
//! [1 byte: format version]
//! [record count: bincode varint]
//! [record: bincode (key, value)] * count
//! ```
//!
//! Records are written least recently used first, so replaying them through
//! `set` rebuilds the same recency order and evicts the stalest entries if
//! the restoring cache is smaller.

use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::cache::RegistryCache;
use crate::error::{Error, Result};
use crate::weight::Weighted;

/// Magic header for registry snapshots
pub const SNAPSHOT_MAGIC: &[u8] = b"TUNREG\n";

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u8 = 1;

/// Largest encoded record `load` accepts (1 MiB)
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

fn config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// Decoding refuses length prefixes past [`MAX_RECORD_SIZE`] before allocating
fn decode_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_RECORD_SIZE>()
}

impl<K, V> RegistryCache<K, V>
where
    K: Hash + Eq + Clone + Serialize + DeserializeOwned,
    V: Weighted + Clone + Serialize + DeserializeOwned,
{
    /// Write every entry to `writer`.
    ///
    /// The entries are copied out under the lock first; encoding and I/O
    /// happen after it is released.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let items = self.items();

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&[SNAPSHOT_VERSION])?;
        bincode::serde::encode_into_std_write(items.len() as u64, writer, config())?;
        for (key, value) in items.iter().rev() {
            bincode::serde::encode_into_std_write((key, value), writer, config())?;
        }
        writer.flush()?;

        Ok(items.len())
    }

    /// Replay a snapshot from `reader` through [`set`](Self::set).
    ///
    /// Records are applied as they are decoded. On a malformed or truncated
    /// stream the records read so far stay in the cache.
    pub fn load<R: Read>(&self, reader: &mut R) -> Result<usize> {
        let mut magic = [0u8; SNAPSHOT_MAGIC.len()];
        reader
            .read_exact(&mut magic)
            .map_err(|e| Error::Decode(format!("Snapshot header unreadable: {}", e)))?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Decode("Invalid snapshot magic header".to_string()));
        }

        let mut version = [0u8; 1];
        reader
            .read_exact(&mut version)
            .map_err(|e| Error::Decode(format!("Snapshot version unreadable: {}", e)))?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedVersion(version[0]));
        }

        let count: u64 = bincode::serde::decode_from_std_read(reader, decode_config())?;
        for _ in 0..count {
            let (key, value): (K, V) =
                bincode::serde::decode_from_std_read(reader, decode_config())?;
            self.set(key, value);
        }

        Ok(count as usize)
    }

    /// Save to `path`, creating or truncating the file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        let saved = self.save(&mut writer)?;

        info!("Saved {} registry entries to {:?}", saved, path);
        Ok(saved)
    }

    /// Load from the snapshot file at `path`
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let loaded = self.load(&mut reader)?;

        info!("Loaded {} registry entries from {:?}", loaded, path);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn filled() -> RegistryCache<String, String> {
        let cache = RegistryCache::new(1024);
        cache.set("client-a".to_string(), "http://a.example.com".to_string());
        cache.set("client-b".to_string(), "http://b.example.com".to_string());
        cache.set("client-c".to_string(), "tcp://example.com:4000".to_string());
        cache.get(&"client-a".to_string());
        cache
    }

    #[test]
    fn test_save_clear_load() {
        let cache = filled();
        let before: HashSet<_> = cache.items().into_iter().collect();
        let order = cache.keys();

        let mut buf = Vec::new();
        assert_eq!(cache.save(&mut buf).unwrap(), 3);

        cache.clear();
        assert!(cache.is_empty());

        assert_eq!(cache.load(&mut Cursor::new(&buf)).unwrap(), 3);
        let after: HashSet<_> = cache.items().into_iter().collect();
        assert_eq!(before, after);
        assert_eq!(cache.keys(), order);
    }

    #[test]
    fn test_load_into_smaller_cache_keeps_recent() {
        let cache = filled();
        let mut buf = Vec::new();
        cache.save(&mut buf).unwrap();

        let small = RegistryCache::<String, String>::new(45);
        small.load(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(small.keys(), vec!["client-a", "client-c"]);
        assert!(small.stats().size <= 45);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.cache");
        let cache = filled();

        cache.save_to_file(&path).unwrap();
        // Saving again truncates instead of appending.
        cache.save_to_file(&path).unwrap();

        let restored = RegistryCache::<String, String>::new(1024);
        assert_eq!(restored.load_from_file(&path).unwrap(), 3);
        assert_eq!(restored.keys(), cache.keys());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let cache = RegistryCache::<String, String>::new(16);

        let err = cache.load_from_file(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_bad_magic_is_decode_error() {
        let cache = RegistryCache::<String, String>::new(16);

        let err = cache.load(&mut Cursor::new(b"NOTREG\n\x01")).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let mut stale = SNAPSHOT_MAGIC.to_vec();
        stale.push(9);
        let err = cache.load(&mut Cursor::new(stale)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(9)));
    }

    #[test]
    fn test_truncated_stream_keeps_partial_load() {
        let cache = filled();
        let mut buf = Vec::new();
        cache.save(&mut buf).unwrap();
        buf.truncate(buf.len() - 4);

        let restored = RegistryCache::<String, String>::new(1024);
        let err = restored.load(&mut Cursor::new(&buf)).unwrap_err();

        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_huge_length_prefix_is_decode_error() {
        let mut buf = SNAPSHOT_MAGIC.to_vec();
        buf.push(SNAPSHOT_VERSION);
        buf.push(1); // one record
        buf.push(0xFD); // u64 string length follows
        buf.extend_from_slice(&(1u64 << 40).to_le_bytes());

        let cache = RegistryCache::<String, String>::new(16);
        let err = cache.load(&mut Cursor::new(buf)).unwrap_err();

        assert!(matches!(err, Error::Decode(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_record_over_limit_is_rejected() {
        let cache = RegistryCache::<String, String>::new(u64::MAX);
        cache.set("big".to_string(), "x".repeat(MAX_RECORD_SIZE + 1));
        let mut buf = Vec::new();
        cache.save(&mut buf).unwrap();

        let restored = RegistryCache::<String, String>::new(u64::MAX);
        let err = restored.load(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
