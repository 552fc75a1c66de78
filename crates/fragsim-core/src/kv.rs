//! Embedded sorted key-value storage
//!
//! [`SortedFileKv`] keeps a sorted map in memory and persists it to a single
//! file, rewritten through a temporary file and a rename on every flush.
//!
//! ```text
//! [magic: "FSKV0001"]
//! [attribute_count: u32] [entry_count: u64]
//! [attributes: {key_len: u16, key, value_len: u32, value} × attribute_count]
//! [entries:    {key_len: u16, key, value_len: u32, value} × entry_count]
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::bitset::CodecError;
use crate::error::{Result, StoreError};
use crate::format::{le_u16, le_u32, le_u64};

const KV_MAGIC: [u8; 8] = *b"FSKV0001";

/// Sorted string-keyed byte storage with named attributes
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<&[u8]>;

    /// Insert or replace, returning the previous value
    fn set(&mut self, key: &str, value: Vec<u8>) -> Option<Vec<u8>>;

    fn delete(&mut self, key: &str) -> Option<Vec<u8>>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in key order
    fn iter(&self) -> Box<dyn Iterator<Item = (&str, &[u8])> + '_>;

    /// Entries whose key starts with `prefix`, in key order
    fn prefix_scan<'a>(&'a self, prefix: &'a str) -> Box<dyn Iterator<Item = (&'a str, &'a [u8])> + 'a>;

    fn attribute(&self, name: &str) -> Option<&str>;

    fn set_attribute(&mut self, name: &str, value: &str);

    /// Persist pending changes
    fn flush(&mut self) -> Result<()>;
}

/// Explicit value (de)serializer handed to a typed store
pub struct Codec<T> {
    pub encode: fn(&T) -> Vec<u8>,
    pub decode: fn(&[u8]) -> std::result::Result<T, CodecError>,
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Codec<T> {}

/// Sorted map persisted to one file
#[derive(Debug, Default)]
pub struct SortedFileKv {
    path: Option<PathBuf>,
    entries: BTreeMap<String, Vec<u8>>,
    attributes: BTreeMap<String, String>,
    dirty: bool,
}

impl SortedFileKv {
    /// Store with no backing file; `flush` is a no-op
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `path`, or start empty when it does not exist yet
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Self {
                    path: Some(path),
                    entries: BTreeMap::new(),
                    attributes: BTreeMap::new(),
                    dirty: false,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let (attributes, entries) = decode_file(&bytes)?;
        debug!(path = %path.display(), entries = entries.len(), "loaded key-value file");
        Ok(Self {
            path: Some(path),
            entries,
            attributes,
            dirty: false,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl KeyValueStore for SortedFileKv {
    fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    fn set(&mut self, key: &str, value: Vec<u8>) -> Option<Vec<u8>> {
        self.dirty = true;
        self.entries.insert(key.to_string(), value)
    }

    fn delete(&mut self, key: &str) -> Option<Vec<u8>> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&str, &[u8])> + '_> {
        Box::new(self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
    }

    fn prefix_scan<'a>(&'a self, prefix: &'a str) -> Box<dyn Iterator<Item = (&'a str, &'a [u8])> + 'a> {
        Box::new(
            self.entries
                .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(move |(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.as_str(), v.as_slice())),
        )
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    fn set_attribute(&mut self, name: &str, value: &str) {
        self.dirty = true;
        self.attributes.insert(name.to_string(), value.to_string());
    }

    fn flush(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&KV_MAGIC)?;
            writer.write_all(&(self.attributes.len() as u32).to_le_bytes())?;
            writer.write_all(&(self.entries.len() as u64).to_le_bytes())?;
            for (key, value) in &self.attributes {
                write_record(&mut writer, key, value.as_bytes())?;
            }
            for (key, value) in &self.entries {
                write_record(&mut writer, key, value)?;
            }
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        self.dirty = false;

        debug!(path = %path.display(), entries = self.entries.len(), "flushed key-value file");
        Ok(())
    }
}

impl Drop for SortedFileKv {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "failed to flush key-value file on drop");
            }
        }
    }
}

fn write_record<W: Write>(writer: &mut W, key: &str, value: &[u8]) -> Result<()> {
    if key.len() > u16::MAX as usize {
        return Err(StoreError::InvalidFormatRequest(format!(
            "key of {} bytes exceeds {}",
            key.len(),
            u16::MAX
        )));
    }
    writer.write_all(&(key.len() as u16).to_le_bytes())?;
    writer.write_all(key.as_bytes())?;
    writer.write_all(&(value.len() as u32).to_le_bytes())?;
    writer.write_all(value)?;
    Ok(())
}

type Decoded = (BTreeMap<String, String>, BTreeMap<String, Vec<u8>>);

fn decode_file(bytes: &[u8]) -> Result<Decoded> {
    if bytes.len() < 20 || bytes[0..8] != KV_MAGIC {
        return Err(StoreError::corrupt("not a key-value file"));
    }
    let attribute_count = le_u32(bytes, 8) as usize;
    let entry_count = le_u64(bytes, 12);

    let mut pos = 20;
    let mut attributes = BTreeMap::new();
    for _ in 0..attribute_count {
        let (key, value) = read_record(bytes, &mut pos)?;
        let value = String::from_utf8(value.to_vec()).map_err(|_| StoreError::corrupt("attribute is not UTF-8"))?;
        attributes.insert(key, value);
    }
    let mut entries = BTreeMap::new();
    for _ in 0..entry_count {
        let (key, value) = read_record(bytes, &mut pos)?;
        entries.insert(key, value.to_vec());
    }
    if pos != bytes.len() {
        return Err(StoreError::corrupt(format!("{} trailing bytes", bytes.len() - pos)));
    }
    Ok((attributes, entries))
}

fn read_record<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<(String, &'a [u8])> {
    let truncated = || StoreError::corrupt("truncated key-value record");
    if bytes.len() < *pos + 2 {
        return Err(truncated());
    }
    let key_len = le_u16(bytes, *pos) as usize;
    *pos += 2;
    let key = bytes.get(*pos..*pos + key_len).ok_or_else(truncated)?;
    let key = std::str::from_utf8(key)
        .map_err(|_| StoreError::corrupt("key is not UTF-8"))?
        .to_string();
    *pos += key_len;

    if bytes.len() < *pos + 4 {
        return Err(truncated());
    }
    let value_len = le_u32(bytes, *pos) as usize;
    *pos += 4;
    let value = bytes.get(*pos..*pos + value_len).ok_or_else(truncated)?;
    *pos += value_len;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_delete() {
        let mut kv = SortedFileKv::in_memory();
        assert!(kv.set("b", vec![2]).is_none());
        assert_eq!(kv.set("b", vec![3]), Some(vec![2]));
        kv.set("a", vec![1]);
        assert_eq!(kv.get("b"), Some(&[3u8][..]));
        assert!(kv.contains("a"));
        assert_eq!(kv.len(), 2);

        assert_eq!(kv.delete("a"), Some(vec![1]));
        assert!(kv.delete("a").is_none());
        assert!(!kv.contains("a"));
        kv.flush().unwrap();
    }

    #[test]
    fn test_iter_sorted_and_prefix_scan() {
        let mut kv = SortedFileKv::in_memory();
        for key in ["3j7v_x", "3j7u_b", "3j7u_a", "2abc"] {
            kv.set(key, key.as_bytes().to_vec());
        }
        let keys: Vec<_> = kv.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["2abc", "3j7u_a", "3j7u_b", "3j7v_x"]);

        let scanned: Vec<_> = kv.prefix_scan("3j7u").map(|(k, _)| k).collect();
        assert_eq!(scanned, vec!["3j7u_a", "3j7u_b"]);
        assert_eq!(kv.prefix_scan("zz").count(), 0);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.kv");
        {
            let mut kv = SortedFileKv::open(&path).unwrap();
            assert!(kv.is_empty());
            kv.set("frag1", vec![1, 2, 3]);
            kv.set("frag2", vec![]);
            kv.set_attribute("number_of_bits", "574331");
            kv.flush().unwrap();
        }

        let kv = SortedFileKv::open(&path).unwrap();
        assert_eq!(kv.len(), 2);
        assert_eq!(kv.get("frag1"), Some(&[1u8, 2, 3][..]));
        assert_eq!(kv.get("frag2"), Some(&[][..]));
        assert_eq!(kv.attribute("number_of_bits"), Some("574331"));
        assert!(!dir.path().join("store.tmp").exists());
    }

    #[test]
    fn test_drop_flushes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.kv");
        {
            let mut kv = SortedFileKv::open(&path).unwrap();
            kv.set("x", vec![9]);
        }
        assert_eq!(SortedFileKv::open(&path).unwrap().get("x"), Some(&[9u8][..]));
    }

    #[test]
    fn test_open_rejects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.kv");
        {
            let mut kv = SortedFileKv::open(&path).unwrap();
            kv.set("frag1", vec![1, 2, 3]);
            kv.flush().unwrap();
        }
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(SortedFileKv::open(&path).unwrap_err().is_corrupt());

        fs::write(&path, b"garbage").unwrap();
        assert!(SortedFileKv::open(&path).unwrap_err().is_corrupt());
    }
}
