//! Persistent label → fingerprint storage over any [`KeyValueStore`]

use std::path::Path;

use crate::bitset::BitSet;
use crate::error::{Result, StoreError};
use crate::kv::{Codec, KeyValueStore, SortedFileKv};
use crate::similarity::FingerprintSet;

const NUMBER_OF_BITS: &str = "number_of_bits";

/// Codec storing bit-sets as count + delta varints
pub fn bitset_codec() -> Codec<BitSet> {
    Codec {
        encode: BitSet::encode,
        decode: BitSet::decode,
    }
}

pub struct FingerprintStore<S: KeyValueStore = SortedFileKv> {
    kv: S,
    codec: Codec<BitSet>,
}

impl FingerprintStore<SortedFileKv> {
    /// Open (or start) a file-backed store with the default bit-set codec
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(SortedFileKv::open(path)?, bitset_codec()))
    }
}

impl<S: KeyValueStore> FingerprintStore<S> {
    pub fn new(kv: S, codec: Codec<BitSet>) -> Self {
        Self { kv, codec }
    }

    /// Universe size shared by every stored fingerprint
    pub fn number_of_bits(&self) -> Result<Option<u32>> {
        match self.kv.attribute(NUMBER_OF_BITS) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| StoreError::corrupt(format!("number_of_bits attribute {:?}", value))),
        }
    }

    pub fn set_number_of_bits(&mut self, number_of_bits: u32) {
        self.kv.set_attribute(NUMBER_OF_BITS, &number_of_bits.to_string());
    }

    pub fn get(&self, label: &str) -> Result<Option<BitSet>> {
        match self.kv.get(label) {
            None => Ok(None),
            Some(bytes) => Ok(Some((self.codec.decode)(bytes)?)),
        }
    }

    pub fn insert(&mut self, label: &str, bits: &BitSet) {
        self.kv.set(label, (self.codec.encode)(bits));
    }

    pub fn remove(&mut self, label: &str) -> bool {
        self.kv.delete(label).is_some()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.kv.contains(label)
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    pub fn extend<I, L>(&mut self, fingerprints: I)
    where
        I: IntoIterator<Item = (L, BitSet)>,
        L: AsRef<str>,
    {
        for (label, bits) in fingerprints {
            self.insert(label.as_ref(), &bits);
        }
    }

    /// Decoded entries in label order
    pub fn iter(&self) -> impl Iterator<Item = Result<(String, BitSet)>> + '_ {
        let decode = self.codec.decode;
        self.kv
            .iter()
            .map(move |(label, bytes)| -> Result<(String, BitSet)> { Ok((label.to_string(), decode(bytes)?)) })
    }

    /// Decoded entries whose label starts with `prefix`, in label order
    pub fn prefix_scan<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = Result<(String, BitSet)>> + 'a {
        let decode = self.codec.decode;
        self.kv
            .prefix_scan(prefix)
            .map(move |(label, bytes)| -> Result<(String, BitSet)> { Ok((label.to_string(), decode(bytes)?)) })
    }

    /// Load everything into memory for similarity computation
    pub fn materialize(&self) -> Result<FingerprintSet> {
        let number_of_bits = self.number_of_bits()?.ok_or_else(|| {
            StoreError::InvalidFormatRequest("fingerprint store has no number_of_bits".to_string())
        })?;
        let mut set = FingerprintSet::new(number_of_bits);
        for entry in self.iter() {
            let (label, bits) = entry?;
            set.insert(label, bits);
        }
        Ok(set)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.kv.flush()
    }

    pub fn into_inner(self) -> S {
        self.kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_insert_get_remove() {
        let mut store = FingerprintStore::new(SortedFileKv::in_memory(), bitset_codec());
        store.insert("frag1", &BitSet::from([1, 2, 3]));
        assert_eq!(store.get("frag1").unwrap(), Some(BitSet::from([1, 2, 3])));
        assert_eq!(store.get("missing").unwrap(), None);
        assert!(store.remove("frag1"));
        assert!(!store.remove("frag1"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_materialize_requires_number_of_bits() {
        let mut store = FingerprintStore::new(SortedFileKv::in_memory(), bitset_codec());
        store.insert("frag1", &BitSet::from([1]));
        assert!(matches!(store.materialize(), Err(StoreError::InvalidFormatRequest(_))));

        store.set_number_of_bits(100);
        let set = store.materialize().unwrap();
        assert_eq!(set.number_of_bits(), 100);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_prefix_scan() {
        let mut store = FingerprintStore::new(SortedFileKv::in_memory(), bitset_codec());
        store.extend([
            ("3j7u_NDP_frag1", BitSet::from([1])),
            ("3j7u_NDP_frag2", BitSet::from([2])),
            ("3wvm_STE_frag1", BitSet::from([3])),
        ]);
        let labels: Vec<_> = store.prefix_scan("3j7u").map(|r| r.unwrap().0).collect();
        assert_eq!(labels, vec!["3j7u_NDP_frag1", "3j7u_NDP_frag2"]);
    }

    #[test]
    fn test_persisted_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fingerprints.kv");
        {
            let mut store = FingerprintStore::open(&path).unwrap();
            store.set_number_of_bits(574_331);
            store.insert("a", &BitSet::from([1, 2, 3]));
            store.insert("b", &BitSet::from([1, 2, 4, 5, 8]));
            store.flush().unwrap();
        }
        let store = FingerprintStore::open(&path).unwrap();
        assert_eq!(store.number_of_bits().unwrap(), Some(574_331));
        let set = store.materialize().unwrap();
        assert_eq!(set.get("b"), Some(&BitSet::from([1, 2, 4, 5, 8])));
    }

    #[test]
    fn test_corrupt_value_surfaces() {
        let mut kv = SortedFileKv::in_memory();
        kv.set("bad", vec![3, 1]);
        let store = FingerprintStore::new(kv, bitset_codec());
        assert!(matches!(store.get("bad"), Err(StoreError::Codec(_))));
        assert!(store.iter().next().unwrap().is_err());
    }
}
