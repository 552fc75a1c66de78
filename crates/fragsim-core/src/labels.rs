//! Bidirectional label ↔ id mapping
//!
//! Both store formats persist their label map as one section:
//!
//! ```text
//! [entry_count: u32]
//! [string_pool_offset: u32]
//! [entries: {id: u32, offset: u32, len: u16, reserved: u16} × entry_count]
//! [string_pool: packed UTF-8 labels]
//! ```
//!
//! Entries are written in ascending id order.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, StoreError};
use crate::format::{le_u16, le_u32, FormatError};

const SECTION_HEADER: usize = 8;
const ENTRY_SIZE: usize = 12;

/// Longest label the section layout can hold, in bytes
pub const MAX_LABEL_LEN: usize = u16::MAX as usize;

/// Bijection between labels and integer ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelIndex {
    id2label: BTreeMap<u32, String>,
    label2id: HashMap<String, u32>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign dense ids `0..n` in iteration order
    pub fn from_labels<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut index = Self::new();
        for (id, label) in labels.into_iter().enumerate() {
            index.insert(label, id as u32)?;
        }
        Ok(index)
    }

    /// Build from explicit `(label, id)` entries
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let mut index = Self::new();
        for (label, id) in entries {
            index.insert(label, id)?;
        }
        Ok(index)
    }

    /// Add a mapping. Re-adding an identical mapping is a no-op.
    pub fn insert(&mut self, label: impl Into<String>, id: u32) -> Result<()> {
        let label = label.into();
        if label.len() > MAX_LABEL_LEN {
            return Err(StoreError::LabelTooLong { len: label.len() });
        }
        if let Some(&existing) = self.label2id.get(&label) {
            if existing == id {
                return Ok(());
            }
            return Err(StoreError::DuplicateLabel { label, existing });
        }
        if let Some(existing) = self.id2label.get(&id) {
            return Err(StoreError::DuplicateId {
                id,
                existing: existing.clone(),
            });
        }
        self.id2label.insert(id, label.clone());
        self.label2id.insert(label, id);
        Ok(())
    }

    pub fn by_label(&self, label: &str) -> Result<u32> {
        self.label2id
            .get(label)
            .copied()
            .ok_or_else(|| StoreError::LabelNotFound(label.to_string()))
    }

    pub fn by_id(&self, id: u32) -> Result<&str> {
        self.id2label
            .get(&id)
            .map(String::as_str)
            .ok_or(StoreError::IdNotFound(id))
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.label2id.contains_key(label)
    }

    pub fn contains_id(&self, id: u32) -> bool {
        self.id2label.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.id2label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2label.is_empty()
    }

    /// `(id, label)` in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.id2label.iter().map(|(&id, label)| (id, label.as_str()))
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.id2label.keys().copied()
    }

    /// Smallest id above every assigned id, `None` once `u32::MAX` is taken
    pub fn next_id(&self) -> Option<u32> {
        match self.id2label.keys().next_back() {
            Some(&max) => max.checked_add(1),
            None => Some(0),
        }
    }

    /// Whether ids are exactly `0..len`
    pub fn is_dense(&self) -> bool {
        // ids are unique, so the largest one pins the rest
        self.id2label
            .keys()
            .next_back()
            .map_or(true, |&max| max as u64 + 1 == self.len() as u64)
    }

    /// Bring every label of `other` into `self`, giving unseen labels fresh ids.
    ///
    /// Returns the translation from `other`'s ids to `self`'s ids. On error
    /// `self` is left as it was.
    pub fn merge(&mut self, other: &LabelIndex) -> Result<HashMap<u32, u32>> {
        let mut remap = HashMap::with_capacity(other.len());
        let mut fresh = Vec::new();
        let mut next = self.next_id();
        for (other_id, label) in other.iter() {
            let id = match self.label2id.get(label) {
                Some(&id) => id,
                None => {
                    let id = next.ok_or_else(|| StoreError::IdsExhausted(label.to_string()))?;
                    next = id.checked_add(1);
                    fresh.push((label, id));
                    id
                }
            };
            remap.insert(other_id, id);
        }
        for (label, id) in fresh {
            self.insert(label, id)?;
        }
        Ok(remap)
    }

    /// Serialize to the on-disk section layout
    pub fn encode(&self) -> Vec<u8> {
        let entries_size = self.len() * ENTRY_SIZE;
        let string_pool_offset = (SECTION_HEADER + entries_size) as u32;
        let pool_size: usize = self.id2label.values().map(String::len).sum();

        let mut buf = Vec::with_capacity(SECTION_HEADER + entries_size + pool_size);
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        buf.extend_from_slice(&string_pool_offset.to_le_bytes());

        let mut pool = Vec::with_capacity(pool_size);
        for (&id, label) in &self.id2label {
            // insert caps labels at MAX_LABEL_LEN
            let bytes = label.as_bytes();
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&(pool.len() as u32).to_le_bytes());
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes());
            pool.extend_from_slice(bytes);
        }
        buf.extend_from_slice(&pool);
        buf
    }

    /// Parse a section produced by [`LabelIndex::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let invalid = |reason: String| {
            StoreError::Format(FormatError::InvalidSection {
                section: "labels",
                reason,
            })
        };

        if bytes.len() < SECTION_HEADER {
            return Err(invalid(format!("{} bytes, need {}", bytes.len(), SECTION_HEADER)));
        }
        let count = le_u32(bytes, 0) as usize;
        let pool_offset = le_u32(bytes, 4) as usize;
        let entries_end = count
            .checked_mul(ENTRY_SIZE)
            .and_then(|n| n.checked_add(SECTION_HEADER))
            .ok_or_else(|| invalid(format!("entry count {} overflows", count)))?;
        if pool_offset != entries_end || pool_offset > bytes.len() {
            return Err(invalid(format!(
                "string pool at {} but entries end at {} of {}",
                pool_offset,
                entries_end,
                bytes.len()
            )));
        }

        let pool = &bytes[pool_offset..];
        let mut index = Self::new();
        for i in 0..count {
            let at = SECTION_HEADER + i * ENTRY_SIZE;
            let id = le_u32(bytes, at);
            let offset = le_u32(bytes, at + 4) as usize;
            let len = le_u16(bytes, at + 8) as usize;
            let raw = pool
                .get(offset..offset + len)
                .ok_or_else(|| invalid(format!("label {} outside string pool", i)))?;
            let label = std::str::from_utf8(raw).map_err(|e| invalid(format!("label {}: {}", i, e)))?;
            index
                .insert(label, id)
                .map_err(|e| invalid(format!("entry {}: {}", i, e)))?;
        }
        Ok(index)
    }
}
