//! Sparse append-only pair store (`.fsp`)
//!
//! Each stored similarity is a fixed 10-byte record `{a: u32, b: u32, score: u16}`
//! written right after the header. The label map and the optional endpoint
//! indexes live in a trailer that is rewritten on [`PairStore::flush`].
//!
//! ```text
//! [header: 64 bytes]
//! [pairs: 10 × N]
//! [labels section]
//! [index sorted by (a, b): 10 × N]   (optional)
//! [index sorted by (b, a): 10 × N]   (optional)
//! ```
//!
//! Appending rows invalidates the indexes; call [`PairStore::add_indexes`]
//! once bulk loading is done.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::format::{
    flags, le_u16, le_u32, read_exact_at, read_prefix, write_all_at, PairHeader, HEADER_SIZE, PAIR_RECORD_SIZE,
};
use crate::labels::LabelIndex;
use crate::quantize::{Precision, ScoreHistogram, DEFAULT_PRECISION};
use crate::similarity::ScoredPair;

/// Records read per frame by scans that do not pick their own frame size
pub const DEFAULT_SCAN_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Append,
}

/// Creation knobs for a new pair store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairStoreOptions {
    pub precision: u16,
    /// Sizing hint recorded in the header
    pub expected_rows: u64,
}

impl Default for PairStoreOptions {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            expected_rows: 0,
        }
    }
}

/// One stored edge with its quantized score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairRecord {
    pub a: u32,
    pub b: u32,
    pub score: u16,
}

impl PairRecord {
    pub fn new(a: u32, b: u32, score: u16) -> Self {
        Self { a, b, score }
    }

    pub fn to_bytes(&self) -> [u8; PAIR_RECORD_SIZE] {
        let mut buf = [0u8; PAIR_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.a.to_le_bytes());
        buf[4..8].copy_from_slice(&self.b.to_le_bytes());
        buf[8..10].copy_from_slice(&self.score.to_le_bytes());
        buf
    }

    /// Parse a record from the first 10 bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            a: le_u32(bytes, 0),
            b: le_u32(bytes, 4),
            score: le_u16(bytes, 8),
        }
    }
}

/// Summary figures reported by `fragsim stats`
#[derive(Debug, Clone, Serialize)]
pub struct PairStats {
    pub pairs: u64,
    pub labels: usize,
    pub precision: u16,
    pub indexed: bool,
    pub file_bytes: u64,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub mean_score: Option<f64>,
}

pub struct PairStore {
    path: PathBuf,
    file: File,
    header: PairHeader,
    precision: Precision,
    labels: LabelIndex,
    mode: OpenMode,
    dirty: bool,
}

impl PairStore {
    /// Create (or truncate) a pair store for appending
    pub fn create<P: AsRef<Path>>(path: P, expected_rows: u64, precision: u16) -> Result<Self> {
        Self::create_with(
            path,
            PairStoreOptions {
                precision,
                expected_rows,
            },
        )
    }

    pub fn create_with<P: AsRef<Path>>(path: P, options: PairStoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let precision = Precision::new(options.precision).ok_or_else(|| {
            StoreError::InvalidFormatRequest("precision must be at least 1".to_string())
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let header = PairHeader::new(options.precision, options.expected_rows);
        file.write_all(&header.to_bytes())?;

        debug!(path = %path.display(), precision = options.precision, "created pair store");

        Ok(Self {
            path,
            file,
            header,
            precision,
            labels: LabelIndex::new(),
            mode: OpenMode::Append,
            dirty: true,
        })
    }

    /// Open an existing pair store
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::Append)
            .open(&path)?;
        let file_len = file.metadata()?.len();

        let mut header_bytes = [0u8; HEADER_SIZE];
        let read = read_prefix(&file, &mut header_bytes)?;
        let header = PairHeader::from_bytes(&header_bytes[..read])?;
        header.validate(file_len)?;

        let precision = Precision::new(header.precision)
            .ok_or_else(|| StoreError::corrupt("zero precision in header"))?;

        let labels = if header.has_labels() {
            let mut bytes = vec![0u8; header.labels_len as usize];
            read_exact_at(&file, header.labels_offset, &mut bytes)?;
            LabelIndex::decode(&bytes)?
        } else {
            LabelIndex::new()
        };

        Ok(Self {
            path,
            file,
            header,
            precision,
            labels,
            mode,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Number of stored pairs
    pub fn len(&self) -> u64 {
        self.header.pair_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.pair_count == 0
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn labels(&self) -> &LabelIndex {
        &self.labels
    }

    pub fn is_indexed(&self) -> bool {
        self.header.is_indexed()
    }

    pub fn expected_rows(&self) -> u64 {
        self.header.expected_rows
    }

    fn check_writable(&self) -> Result<()> {
        match self.mode {
            OpenMode::Append => Ok(()),
            OpenMode::Read => Err(StoreError::ReadOnly),
        }
    }

    fn invalidate_indexes(&mut self) {
        if self.header.is_indexed() {
            info!(path = %self.path.display(), "pair store modified, dropping endpoint indexes");
            self.header.flags &= !flags::INDEXED;
            self.header.index_offset = 0;
        }
        self.dirty = true;
    }

    /// Replace the persisted label map
    pub fn set_labels(&mut self, labels: LabelIndex) -> Result<()> {
        self.check_writable()?;
        self.labels = labels;
        self.invalidate_indexes();
        Ok(())
    }

    /// Append raw records after the last stored pair
    pub fn append_records<I>(&mut self, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = PairRecord>,
    {
        self.check_writable()?;
        self.invalidate_indexes();

        let start = self.header.pairs_end();
        self.file.seek(SeekFrom::Start(start))?;
        let mut written = 0u64;
        {
            let mut writer = BufWriter::new(&mut self.file);
            for record in records {
                writer.write_all(&record.to_bytes())?;
                written += 1;
            }
            writer.flush()?;
        }
        self.header.pair_count += written;
        Ok(written)
    }

    /// Translate labels through `label2id`, quantize scores and append, then flush.
    ///
    /// The whole `label2id` catalog becomes part of this store's label map, so
    /// a label without any pair still answers queries with no hits. A catalog
    /// that maps a known label or id differently fails with `LabelMismatch`
    /// and nothing is written.
    pub fn update<I>(&mut self, pairs: I, label2id: &LabelIndex) -> Result<u64>
    where
        I: IntoIterator<Item = ScoredPair>,
    {
        self.check_writable()?;
        let records = self.translate(pairs, label2id)?;
        self.adopt_labels(label2id)?;
        let written = self.append_records(records)?;
        self.flush()?;
        Ok(written)
    }

    /// [`PairStore::update`] without the flush, for batched writers.
    ///
    /// Only labels used by `pairs` are recorded; batched writers call
    /// [`PairStore::adopt_labels`] once for the full catalog.
    pub fn append_pairs<I>(&mut self, pairs: I, label2id: &LabelIndex) -> Result<u64>
    where
        I: IntoIterator<Item = ScoredPair>,
    {
        self.check_writable()?;
        let records = self.translate(pairs, label2id)?;
        let mut used = LabelIndex::new();
        for record in &records {
            used.insert(label2id.by_id(record.a)?, record.a)?;
            used.insert(label2id.by_id(record.b)?, record.b)?;
        }
        self.adopt_labels(&used)?;
        self.append_records(records)
    }

    /// Add every entry of `catalog` to the label map.
    ///
    /// Fails with `LabelMismatch`, leaving the map untouched, when any entry
    /// disagrees with a mapping already stored.
    pub fn adopt_labels(&mut self, catalog: &LabelIndex) -> Result<()> {
        self.check_writable()?;
        let mut added = Vec::new();
        for (id, label) in catalog.iter() {
            if !self.check_label(label, id)? {
                added.push((label, id));
            }
        }
        if added.is_empty() {
            return Ok(());
        }
        for &(label, id) in &added {
            self.labels.insert(label, id)?;
        }
        self.invalidate_indexes();
        Ok(())
    }

    /// Quantized records for `pairs`, checked against both label maps before anything is written
    fn translate<I>(&self, pairs: I, label2id: &LabelIndex) -> Result<Vec<PairRecord>>
    where
        I: IntoIterator<Item = ScoredPair>,
    {
        let mut records = Vec::new();
        for pair in pairs {
            let a = label2id.by_label(&pair.label1)?;
            let b = label2id.by_label(&pair.label2)?;
            self.check_label(&pair.label1, a)?;
            self.check_label(&pair.label2, b)?;
            records.push(PairRecord::new(a, b, self.precision.quantize(pair.score)));
        }
        Ok(records)
    }

    /// Whether `label -> id` is already stored; an error when it contradicts the label map
    fn check_label(&self, label: &str, id: u32) -> Result<bool> {
        if let Ok(existing) = self.labels.by_label(label) {
            if existing != id {
                return Err(StoreError::LabelMismatch(format!(
                    "{} is id {} in {} but {} in the supplied label map",
                    label,
                    existing,
                    self.path.display(),
                    id
                )));
            }
            return Ok(true);
        }
        if let Ok(existing) = self.labels.by_id(id) {
            return Err(StoreError::LabelMismatch(format!(
                "id {} is {} in {} but {} in the supplied label map",
                id,
                existing,
                self.path.display(),
                label
            )));
        }
        Ok(false)
    }

    fn record_label(&mut self, label: &str, id: u32) -> Result<()> {
        if !self.check_label(label, id)? {
            self.labels.insert(label, id)?;
        }
        Ok(())
    }

    /// Persist the label trailer and header
    pub fn flush(&mut self) -> Result<()> {
        if self.mode == OpenMode::Read || !self.dirty {
            return Ok(());
        }

        let labels = self.labels.encode();
        let labels_offset = self.header.pairs_end();
        write_all_at(&mut self.file, labels_offset, &labels)?;

        self.header.labels_offset = labels_offset;
        self.header.labels_len = labels.len() as u64;
        if self.labels.is_empty() {
            self.header.flags &= !flags::HAS_LABELS;
        } else {
            self.header.flags |= flags::HAS_LABELS;
        }
        self.header.flags &= !flags::INDEXED;
        self.header.index_offset = 0;

        let end = labels_offset + labels.len() as u64;
        self.file.set_len(end)?;
        write_all_at(&mut self.file, 0, &self.header.to_bytes())?;
        self.file.sync_all()?;
        self.dirty = false;

        debug!(pairs = self.header.pair_count, labels = self.labels.len(), "flushed pair store");
        Ok(())
    }

    /// Flush and close
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Sort copies of the pairs by each endpoint and persist them after the labels
    pub fn add_indexes(&mut self) -> Result<()> {
        self.check_writable()?;
        self.dirty = true;
        self.flush()?;

        let mut by_a = self.read_all_records()?;
        let mut by_b = by_a.clone();
        by_a.sort_unstable_by_key(|r| (r.a, r.b));
        by_b.sort_unstable_by_key(|r| (r.b, r.a));

        let index_offset = self.header.labels_offset + self.header.labels_len;
        self.file.seek(SeekFrom::Start(index_offset))?;
        {
            let mut writer = BufWriter::new(&mut self.file);
            for record in by_a.iter().chain(by_b.iter()) {
                writer.write_all(&record.to_bytes())?;
            }
            writer.flush()?;
        }

        self.header.index_offset = index_offset;
        self.header.flags |= flags::INDEXED;
        write_all_at(&mut self.file, 0, &self.header.to_bytes())?;
        self.file.sync_all()?;

        info!(pairs = self.header.pair_count, path = %self.path.display(), "built endpoint indexes");
        Ok(())
    }

    fn read_all_records(&self) -> Result<Vec<PairRecord>> {
        let mut all = Vec::with_capacity(self.header.pair_count as usize);
        for frame in self.frames(DEFAULT_SCAN_FRAME) {
            all.extend(frame?);
        }
        Ok(all)
    }

    /// Stream stored records in frames of at most `frame_size`
    pub fn frames(&self, frame_size: usize) -> Frames<'_> {
        Frames {
            file: &self.file,
            next_row: 0,
            end_row: self.header.pair_count,
            frame_size: frame_size.max(1),
        }
    }

    /// Stream stored records one at a time
    pub fn records(&self) -> Records<'_> {
        Records {
            frames: self.frames(DEFAULT_SCAN_FRAME),
            current: Vec::new().into_iter(),
        }
    }

    /// Stored pairs as labelled, dequantized triples
    pub fn iter(&self) -> impl Iterator<Item = Result<ScoredPair>> + '_ {
        self.records().map(move |record| {
            let record = record?;
            Ok(ScoredPair::new(
                self.labels.by_id(record.a)?,
                self.labels.by_id(record.b)?,
                self.precision.dequantize(record.score),
            ))
        })
    }

    /// All partners of `id` scoring at least `cutoff`, keyed by partner id.
    ///
    /// Fails with `IdNotFound` when the store carries labels and `id` is not among them.
    pub fn find(&self, id: u32, cutoff: f64) -> Result<HashMap<u32, f64>> {
        if !self.labels.is_empty() && !self.labels.contains_id(id) {
            return Err(StoreError::IdNotFound(id));
        }

        let raw_cutoff = self.precision.raw_cutoff(cutoff);
        let mut best: HashMap<u32, u16> = HashMap::new();
        let mut keep = |record: PairRecord| {
            if (record.score as u32) < raw_cutoff || record.a == record.b {
                return;
            }
            let other = if record.a == id { record.b } else { record.a };
            let entry = best.entry(other).or_insert(record.score);
            if record.score > *entry {
                *entry = record.score;
            }
        };

        if self.header.is_indexed() {
            let section = self.header.index_section_len();
            self.scan_index(self.header.index_offset, id, |r| r.a, &mut keep)?;
            self.scan_index(self.header.index_offset + section, id, |r| r.b, &mut keep)?;
        } else {
            for frame in self.frames(DEFAULT_SCAN_FRAME) {
                for record in frame? {
                    if record.a == id || record.b == id {
                        keep(record);
                    }
                }
            }
        }

        Ok(best
            .into_iter()
            .map(|(other, raw)| (other, self.precision.dequantize(raw)))
            .collect())
    }

    /// Label-level lookup, sorted by descending score and truncated to `limit`
    pub fn find_label(&self, label: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        let id = self.labels.by_label(label)?;
        let mut hits = Vec::new();
        for (other, score) in self.find(id, cutoff)? {
            hits.push((self.labels.by_id(other)?.to_string(), score));
        }
        sort_hits(&mut hits);
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    /// Binary search one sorted index section for records whose key equals `id`
    fn scan_index<K, F>(&self, section_offset: u64, id: u32, key: K, mut visit: F) -> Result<()>
    where
        K: Fn(&PairRecord) -> u32,
        F: FnMut(PairRecord),
    {
        let read_row = |row: u64| -> Result<PairRecord> {
            let mut buf = [0u8; PAIR_RECORD_SIZE];
            read_exact_at(&self.file, section_offset + row * PAIR_RECORD_SIZE as u64, &mut buf)?;
            Ok(PairRecord::from_bytes(&buf))
        };

        // lower bound of key == id
        let (mut lo, mut hi) = (0u64, self.header.pair_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if key(&read_row(mid)?) < id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut row = lo;
        while row < self.header.pair_count {
            let record = read_row(row)?;
            if key(&record) != id {
                break;
            }
            visit(record);
            row += 1;
        }
        Ok(())
    }

    /// Copy every row of `other` into this store, returning the number copied.
    ///
    /// Identical (or absent) label maps copy rows verbatim; otherwise the
    /// other store's labels are merged into this one and rows are remapped.
    pub fn append(&mut self, other: &PairStore) -> Result<u64> {
        self.check_writable()?;
        if self.precision != other.precision {
            return Err(StoreError::IncompatiblePrecision {
                left: self.precision.value(),
                right: other.precision.value(),
            });
        }

        if self.labels.is_empty() {
            self.labels = other.labels.clone();
        }

        let copied = if other.labels.is_empty() || self.labels == other.labels {
            let mut copied = 0;
            for frame in other.frames(DEFAULT_SCAN_FRAME) {
                copied += self.append_records(frame?)?;
            }
            copied
        } else {
            let remap = self.labels.merge(&other.labels)?;
            let translate = |id: u32| remap.get(&id).copied().ok_or(StoreError::IdNotFound(id));
            let mut copied = 0;
            for frame in other.frames(DEFAULT_SCAN_FRAME) {
                let frame = frame?
                    .into_iter()
                    .map(|r| Ok(PairRecord::new(translate(r.a)?, translate(r.b)?, r.score)))
                    .collect::<Result<Vec<_>>>()?;
                copied += self.append_records(frame)?;
            }
            copied
        };

        self.invalidate_indexes();
        self.flush()?;
        info!(copied, from = %other.path.display(), into = %self.path.display(), "appended pair store");
        Ok(copied)
    }

    /// Copy rows whose two labels are both accepted by `keep` into `out`
    pub fn copy_filtered<F>(&self, out: &mut PairStore, keep: F) -> Result<u64>
    where
        F: Fn(&str) -> bool,
    {
        out.check_writable()?;
        if self.precision != out.precision {
            return Err(StoreError::IncompatiblePrecision {
                left: self.precision.value(),
                right: out.precision.value(),
            });
        }

        let kept_ids: HashMap<u32, &str> = self.labels.iter().filter(|(_, label)| keep(label)).collect();
        let mut copied = 0;
        for frame in self.frames(DEFAULT_SCAN_FRAME) {
            let mut batch = Vec::new();
            for record in frame? {
                let (Some(label_a), Some(label_b)) = (kept_ids.get(&record.a), kept_ids.get(&record.b)) else {
                    continue;
                };
                out.record_label(label_a, record.a)?;
                out.record_label(label_b, record.b)?;
                batch.push(record);
            }
            copied += out.append_records(batch)?;
        }
        out.flush()?;
        info!(copied, total = self.len(), "filtered pair store");
        Ok(copied)
    }

    /// Histogram of nonzero stored scores
    pub fn count(&self) -> Result<ScoreHistogram> {
        let mut histogram = ScoreHistogram::new(self.precision);
        for frame in self.frames(DEFAULT_SCAN_FRAME) {
            for record in frame? {
                histogram.add(record.score, 1);
            }
        }
        Ok(histogram)
    }

    pub fn stats(&self) -> Result<PairStats> {
        let (mut min, mut max, mut sum) = (u16::MAX, 0u16, 0u64);
        for record in self.records() {
            let score = record?.score;
            min = min.min(score);
            max = max.max(score);
            sum += score as u64;
        }
        let pairs = self.header.pair_count;
        let decode = |raw: u16| self.precision.dequantize(raw);
        Ok(PairStats {
            pairs,
            labels: self.labels.len(),
            precision: self.precision.value(),
            indexed: self.is_indexed(),
            file_bytes: self.file.metadata()?.len(),
            min_score: (pairs > 0).then(|| decode(min)),
            max_score: (pairs > 0).then(|| decode(max)),
            mean_score: (pairs > 0).then(|| sum as f64 / pairs as f64 / self.precision.value() as f64),
        })
    }
}

impl Drop for PairStore {
    fn drop(&mut self) {
        if self.dirty && self.mode == OpenMode::Append {
            if let Err(e) = self.flush() {
                warn!(path = %self.path.display(), error = %e, "failed to flush pair store on drop");
            }
        }
    }
}

/// Merge several pair stores into a new indexed one.
///
/// Labels and precision come from the first input; later inputs are remapped
/// when their label maps differ.
pub fn merge_pair_stores<P: AsRef<Path>, Q: AsRef<Path>>(inputs: &[P], output: Q) -> Result<u64> {
    let Some(first) = inputs.first() else {
        return Err(StoreError::InvalidFormatRequest("no input pair stores to merge".to_string()));
    };
    let first = PairStore::open(first, OpenMode::Read)?;

    let mut expected_rows = 0u64;
    for input in inputs {
        expected_rows += PairStore::open(input, OpenMode::Read)?.len();
    }

    let mut out = PairStore::create(output, expected_rows, first.precision().value())?;
    out.set_labels(first.labels().clone())?;

    let mut total = 0;
    for input in inputs {
        let store = PairStore::open(input, OpenMode::Read)?;
        total += out.append(&store)?;
    }
    out.add_indexes()?;
    out.close()?;
    Ok(total)
}

/// Sort hits by descending score, ties by label
pub(crate) fn sort_hits(hits: &mut [(String, f64)]) {
    hits.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
}

pub struct Frames<'a> {
    file: &'a File,
    next_row: u64,
    end_row: u64,
    frame_size: usize,
}

impl<'a> Iterator for Frames<'a> {
    type Item = Result<Vec<PairRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.end_row {
            return None;
        }
        let rows = (self.end_row - self.next_row).min(self.frame_size as u64);
        let mut buf = vec![0u8; rows as usize * PAIR_RECORD_SIZE];
        if let Err(e) = read_exact_at(self.file, PairHeader::record_offset(self.next_row), &mut buf) {
            self.next_row = self.end_row;
            return Some(Err(e.into()));
        }
        self.next_row += rows;
        Some(Ok(buf.chunks_exact(PAIR_RECORD_SIZE).map(PairRecord::from_bytes).collect()))
    }
}

pub struct Records<'a> {
    frames: Frames<'a>,
    current: std::vec::IntoIter<PairRecord>,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<PairRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            match self.frames.next()? {
                Ok(frame) => self.current = frame.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
