//! Frozen dense similarity matrix (`.fsm`)
//!
//! An N×N grid of quantized `u16` scores. Each row is stored as one
//! LZ4 block of little-endian cells so a query decompresses exactly one row.
//!
//! ```text
//! [header: 64 bytes]
//! [labels section]               label of dense id i is the row/column i
//! [row directory: N × 12 bytes]  {offset: u64, len: u32}; len 0 = all-zero row
//! [row blobs]                    lz4(size-prepended LE u16 × N)
//! ```
//!
//! The row directory is sized once at creation; a matrix cannot grow.
//! Rewritten rows are appended at the end of the file, and [`MatrixStore::finish`]
//! compacts away the superseded blobs.
//!
//! # Safety
//!
//! Read-only handles memory-map the file. The file must not be truncated or
//! modified while mapped.

use std::borrow::Cow;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::format::{
    flags, le_u32, le_u64, read_exact_at, read_prefix, write_all_at, MatrixHeader, HEADER_SIZE, ROW_ENTRY_SIZE,
};
use crate::labels::LabelIndex;
use crate::pairs::sort_hits;
use crate::quantize::{Precision, ScoreAxis, ScoreHistogram};
use crate::similarity::FillPolicy;

/// Which triangle of the grid a histogram covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Triangle {
    /// Cells with column > row
    #[default]
    Upper,
    /// Cells with column < row
    Lower,
}

impl Triangle {
    #[inline]
    fn contains(self, row: usize, col: usize) -> bool {
        match self {
            Triangle::Upper => col > row,
            Triangle::Lower => col < row,
        }
    }
}

/// Location of one compressed row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RowEntry {
    offset: u64,
    len: u32,
}

enum Backing {
    Mapped(Mmap),
    Writable { file: File, stale_bytes: u64 },
}

/// Summary figures reported by `fragsim stats`
#[derive(Debug, Clone, Serialize)]
pub struct MatrixStats {
    pub order: usize,
    pub precision: u16,
    pub fill_policy: String,
    pub populated_rows: usize,
    pub compressed_bytes: u64,
    pub file_bytes: u64,
}

pub struct MatrixStore {
    path: PathBuf,
    header: MatrixHeader,
    precision: Precision,
    labels: LabelIndex,
    directory: Vec<RowEntry>,
    backing: Backing,
    finished: bool,
}

impl MatrixStore {
    /// Open a frozen matrix read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let (header, labels, directory) = parse_layout(&mmap)?;

        Ok(Self {
            path,
            precision: checked_precision(header.precision)?,
            header,
            labels,
            directory,
            backing: Backing::Mapped(mmap),
            finished: true,
        })
    }

    /// Open an existing matrix to fill more rows
    pub fn open_writable<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        let mut header_bytes = [0u8; HEADER_SIZE];
        let read = read_prefix(&file, &mut header_bytes)?;
        let header = MatrixHeader::from_bytes(&header_bytes[..read])?;
        header.validate(file_len)?;
        if !header.is_initialized() {
            return Err(StoreError::corrupt("matrix layout never initialized"));
        }

        // Only the metadata sections are needed up front.
        let meta_end = (header.directory_offset + header.directory_len()) as usize;
        let mut meta = vec![0u8; meta_end];
        read_exact_at(&file, 0, &mut meta)?;
        let labels = parse_labels(&meta, &header)?;
        let directory = parse_directory(&meta, &header)?;

        Ok(Self {
            path,
            precision: checked_precision(header.precision)?,
            header,
            labels,
            directory,
            backing: Backing::Writable { file, stale_bytes: 0 },
            finished: false,
        })
    }

    /// Lay out an empty matrix over dense `labels`; every row starts all-zero
    pub fn create<P: AsRef<Path>>(path: P, labels: LabelIndex, precision: u16, policy: FillPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !labels.is_dense() {
            return Err(StoreError::LabelMismatch(
                "matrix labels must use dense ids 0..n".to_string(),
            ));
        }
        let precision_value = checked_precision(precision)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let label_bytes = labels.encode();
        let mut header = MatrixHeader::new(precision, policy);
        header.flags |= flags::INITIALIZED;
        header.order = labels.len() as u32;
        header.labels_offset = HEADER_SIZE as u64;
        header.labels_len = label_bytes.len() as u64;
        header.directory_offset = header.labels_offset + header.labels_len;
        header.data_end = header.directory_offset + header.directory_len();

        let directory = vec![RowEntry::default(); labels.len()];
        {
            let mut writer = BufWriter::new(&mut file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&label_bytes)?;
            writer.write_all(&encode_directory(&directory))?;
            writer.flush()?;
        }

        info!(order = labels.len(), precision, policy = ?policy, path = %path.display(), "created matrix");

        Ok(Self {
            path,
            header,
            precision: precision_value,
            labels,
            directory,
            backing: Backing::Writable { file, stale_bytes: 0 },
            finished: false,
        })
    }

    /// Build a matrix directly from dense scores; the diagonal is forced to zero
    pub fn from_array<P: AsRef<Path>>(
        path: P,
        labels: &[String],
        rows: &[Vec<f64>],
        precision: u16,
        policy: FillPolicy,
    ) -> Result<Self> {
        let n = labels.len();
        if rows.len() != n || rows.iter().any(|row| row.len() != n) {
            return Err(StoreError::InvalidFormatRequest(format!(
                "expected a {}x{} array of scores",
                n, n
            )));
        }

        let path = path.as_ref().to_path_buf();
        let label_index = LabelIndex::from_labels(labels.iter().cloned())?;
        let mut matrix = Self::create(&path, label_index, precision, policy)?;
        let quantizer = matrix.precision;
        for (i, row) in rows.iter().enumerate() {
            let cells: Vec<u16> = row
                .iter()
                .enumerate()
                .map(|(j, &score)| if i == j { 0 } else { quantizer.quantize(score) })
                .collect();
            matrix.write_row(i, &cells)?;
        }
        matrix.finish()?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Matrix order N
    pub fn len(&self) -> usize {
        self.directory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn labels(&self) -> &LabelIndex {
        &self.labels
    }

    pub fn fill_policy(&self) -> FillPolicy {
        self.header.fill_policy()
    }

    fn compressed_bytes(&self, entry: RowEntry) -> Result<Cow<'_, [u8]>> {
        let start = entry.offset;
        let end = entry.offset + entry.len as u64;
        match &self.backing {
            Backing::Mapped(mmap) => mmap
                .get(start as usize..end as usize)
                .map(Cow::Borrowed)
                .ok_or_else(|| StoreError::corrupt(format!("row blob {}..{} out of bounds", start, end))),
            Backing::Writable { file, .. } => {
                let mut buf = vec![0u8; entry.len as usize];
                read_exact_at(file, start, &mut buf)?;
                Ok(Cow::Owned(buf))
            }
        }
    }

    /// Raw quantized cells of dense row `row`
    pub fn read_row(&self, row: usize) -> Result<Vec<u16>> {
        let n = self.len();
        let entry = *self.directory.get(row).ok_or(StoreError::IdNotFound(row as u32))?;
        if entry.len == 0 {
            return Ok(vec![0; n]);
        }
        let blob = self.compressed_bytes(entry)?;
        decompress_row(&blob, n).ok_or_else(|| StoreError::corrupt(format!("row {} fails to decompress", row)))
    }

    /// Replace dense row `row`
    pub fn write_row(&mut self, row: usize, cells: &[u16]) -> Result<()> {
        let n = self.len();
        if cells.len() != n {
            return Err(StoreError::InvalidFormatRequest(format!(
                "row has {} cells, matrix order is {}",
                cells.len(),
                n
            )));
        }
        let old = *self.directory.get(row).ok_or(StoreError::IdNotFound(row as u32))?;
        let Backing::Writable { file, stale_bytes } = &mut self.backing else {
            return Err(StoreError::ReadOnly);
        };

        *stale_bytes += old.len as u64;
        let entry = if cells.iter().all(|&c| c == 0) {
            RowEntry::default()
        } else {
            let blob = lz4_flex::compress_prepend_size(&cells_to_le_bytes(cells));
            write_all_at(file, self.header.data_end, &blob)?;
            let entry = RowEntry {
                offset: self.header.data_end,
                len: blob.len() as u32,
            };
            self.header.data_end += blob.len() as u64;
            entry
        };
        self.directory[row] = entry;
        Ok(())
    }

    /// Persist the row directory and header, compacting superseded rows
    pub fn finish(mut self) -> Result<()> {
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let stale = match &self.backing {
            Backing::Writable { stale_bytes, .. } => *stale_bytes,
            Backing::Mapped(_) => return Ok(()),
        };

        if stale > 0 {
            self.compact()?;
        } else if let Backing::Writable { file, .. } = &mut self.backing {
            write_all_at(file, self.header.directory_offset, &encode_directory(&self.directory))?;
            write_all_at(file, 0, &self.header.to_bytes())?;
            file.set_len(self.header.data_end)?;
            file.sync_all()?;
        }
        self.finished = true;
        debug!(path = %self.path.display(), bytes = self.header.data_end, "matrix persisted");
        Ok(())
    }

    /// Rewrite the file sequentially, dropping superseded row blobs
    fn compact(&mut self) -> Result<()> {
        let mut tmp_path: OsString = self.path.as_os_str().to_owned();
        tmp_path.push(".compact");
        let tmp_path = PathBuf::from(tmp_path);

        let mut header = self.header;
        let mut directory = Vec::with_capacity(self.directory.len());
        let mut offset = header.metadata_end();
        for entry in &self.directory {
            directory.push(RowEntry {
                offset: if entry.len == 0 { 0 } else { offset },
                len: entry.len,
            });
            offset += entry.len as u64;
        }
        header.data_end = offset;

        {
            let tmp = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&self.labels.encode())?;
            writer.write_all(&encode_directory(&directory))?;
            for entry in &self.directory {
                if entry.len > 0 {
                    writer.write_all(&self.compressed_bytes(*entry)?)?;
                }
            }
            let tmp = writer.into_inner().map_err(|e| e.into_error())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let reclaimed = self.header.data_end - header.data_end;
        info!(path = %self.path.display(), reclaimed, "compacted matrix");

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.header = header;
        self.directory = directory;
        self.backing = Backing::Writable { file, stale_bytes: 0 };
        Ok(())
    }

    /// Dense id of `label`
    pub fn position(&self, label: &str) -> Result<usize> {
        Ok(self.labels.by_label(label)? as usize)
    }

    /// Hits of dense row `row` at or above `cutoff`, best first, truncated to `limit`
    pub fn find_position(&self, row: usize, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        let raw_cutoff = self.precision.raw_cutoff(cutoff).max(1);
        let cells = self.read_row(row)?;
        let mut hits = Vec::new();
        for (col, &raw) in cells.iter().enumerate() {
            if col == row || (raw as u32) < raw_cutoff {
                continue;
            }
            hits.push((self.labels.by_id(col as u32)?.to_string(), self.precision.dequantize(raw)));
        }
        sort_hits(&mut hits);
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    /// Hits of `query` at or above `cutoff`, best first, truncated to `limit`
    pub fn find(&self, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        self.find_position(self.position(query)?, cutoff, limit)
    }

    /// Every other label with its score, zeros included, in column order
    pub fn get_row(&self, label: &str) -> Result<Vec<(String, f64)>> {
        let row = self.position(label)?;
        let cells = self.read_row(row)?;
        let mut out = Vec::with_capacity(cells.len().saturating_sub(1));
        for (col, &raw) in cells.iter().enumerate() {
            if col != row {
                out.push((self.labels.by_id(col as u32)?.to_string(), self.precision.dequantize(raw)));
            }
        }
        Ok(out)
    }

    /// Raw rows in dense order
    pub fn iter_rows(&self) -> impl Iterator<Item = Result<Vec<u16>>> + '_ {
        (0..self.len()).map(move |row| self.read_row(row))
    }

    /// Full dequantized grid
    pub fn to_dense(&self) -> Result<Vec<Vec<f64>>> {
        self.iter_rows()
            .map(|row| Ok(row?.into_iter().map(|raw| self.precision.dequantize(raw)).collect()))
            .collect()
    }

    /// Histogram of nonzero scores over one triangle. All-zero rows are skipped undecoded.
    pub fn count(&self, triangle: Triangle) -> Result<ScoreHistogram> {
        let mut histogram = ScoreHistogram::new(self.precision);
        for (row, entry) in self.directory.iter().enumerate() {
            if entry.len == 0 {
                continue;
            }
            for (col, &raw) in self.read_row(row)?.iter().enumerate() {
                if triangle.contains(row, col) {
                    histogram.add(raw, 1);
                }
            }
        }
        Ok(histogram)
    }

    /// [`MatrixStore::count`] reported on `axis`
    pub fn count_bins(&self, axis: ScoreAxis, triangle: Triangle) -> Result<Vec<(f64, u64)>> {
        Ok(self.count(triangle)?.bins(axis))
    }

    pub fn stats(&self) -> Result<MatrixStats> {
        let file_bytes = match &self.backing {
            Backing::Mapped(mmap) => mmap.len() as u64,
            Backing::Writable { file, .. } => file.metadata()?.len(),
        };
        Ok(MatrixStats {
            order: self.len(),
            precision: self.precision.value(),
            fill_policy: format!("{:?}", self.fill_policy()),
            populated_rows: self.directory.iter().filter(|e| e.len > 0).count(),
            compressed_bytes: self.directory.iter().map(|e| e.len as u64).sum(),
            file_bytes,
        })
    }
}

impl Drop for MatrixStore {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.persist() {
                warn!(path = %self.path.display(), error = %e, "failed to persist matrix on drop");
            }
        }
    }
}

fn checked_precision(precision: u16) -> Result<Precision> {
    Precision::new(precision).ok_or_else(|| StoreError::InvalidFormatRequest("precision must be at least 1".to_string()))
}

fn parse_layout(bytes: &[u8]) -> Result<(MatrixHeader, LabelIndex, Vec<RowEntry>)> {
    let header = MatrixHeader::from_bytes(bytes)?;
    header.validate(bytes.len() as u64)?;
    if !header.is_initialized() {
        return Err(StoreError::corrupt("matrix layout never initialized"));
    }
    let labels = parse_labels(bytes, &header)?;
    let directory = parse_directory(bytes, &header)?;
    Ok((header, labels, directory))
}

fn parse_labels(bytes: &[u8], header: &MatrixHeader) -> Result<LabelIndex> {
    let start = header.labels_offset as usize;
    let section = bytes
        .get(start..start + header.labels_len as usize)
        .ok_or_else(|| StoreError::corrupt("labels section outside metadata"))?;
    let labels = LabelIndex::decode(section)?;
    if labels.len() != header.order as usize || !labels.is_dense() {
        return Err(StoreError::corrupt(format!(
            "labels section holds {} labels for a matrix of order {}",
            labels.len(),
            header.order
        )));
    }
    Ok(labels)
}

fn parse_directory(bytes: &[u8], header: &MatrixHeader) -> Result<Vec<RowEntry>> {
    let metadata_end = header.metadata_end();
    let start = header.directory_offset as usize;
    if bytes.len() < start + header.directory_len() as usize {
        return Err(StoreError::corrupt("row directory outside metadata"));
    }
    let mut directory = Vec::with_capacity(header.order as usize);
    for row in 0..header.order as usize {
        let at = start + row * ROW_ENTRY_SIZE;
        let entry = RowEntry {
            offset: le_u64(bytes, at),
            len: le_u32(bytes, at + 8),
        };
        let end = entry.offset.checked_add(entry.len as u64);
        if entry.len > 0 && (entry.offset < metadata_end || end.map_or(true, |end| end > header.data_end)) {
            return Err(StoreError::corrupt(format!("row {} blob outside data section", row)));
        }
        directory.push(entry);
    }
    Ok(directory)
}

fn encode_directory(directory: &[RowEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(directory.len() * ROW_ENTRY_SIZE);
    for entry in directory {
        buf.extend_from_slice(&entry.offset.to_le_bytes());
        buf.extend_from_slice(&entry.len.to_le_bytes());
    }
    buf
}

/// Decompress one row blob, rejecting blobs that do not hold exactly `n` cells
fn decompress_row(blob: &[u8], n: usize) -> Option<Vec<u16>> {
    // Check the prepended size before lz4 allocates it.
    if blob.len() < 4 || le_u32(blob, 0) as usize != n * 2 {
        return None;
    }
    let bytes = lz4_flex::decompress_size_prepended(blob).ok()?;
    if bytes.len() != n * 2 {
        return None;
    }
    if cfg!(target_endian = "little") {
        if let Ok(cells) = bytemuck::try_cast_slice::<u8, u16>(&bytes) {
            return Some(cells.to_vec());
        }
    }
    Some(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect())
}

/// Cells in on-disk little-endian order
fn cells_to_le_bytes(cells: &[u16]) -> Cow<'_, [u8]> {
    if cfg!(target_endian = "little") {
        Cow::Borrowed(bytemuck::cast_slice(cells))
    } else {
        Cow::Owned(cells.iter().flat_map(|c| c.to_le_bytes()).collect())
    }
}
