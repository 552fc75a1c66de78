//! Streaming conversion between the sparse pair store and the frozen matrix
//!
//! Freezing reads the pair store in frames. Each frame is folded into a
//! row-keyed accumulator, then every touched row is read, patched and written
//! back once. Memory stays at one frame plus one row plus the row directory,
//! and the result does not depend on the frame size.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::format::{detect_store_kind, read_prefix, StoreKind};
use crate::labels::LabelIndex;
use crate::matrix::MatrixStore;
use crate::pairs::{PairRecord, PairStore};
use crate::similarity::FillPolicy;

/// Default number of pairs per frame
pub const DEFAULT_FRAME_SIZE: usize = 100_000_000;

/// How a frame's score lands in a cell that already holds one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestMode {
    /// Last score in stream order wins
    #[default]
    Overwrite,
    /// Scores add up, saturating at the precision
    Accumulate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeOptions {
    pub frame_size: usize,
    /// Stop after this many pairs
    pub limit: Option<u64>,
    pub policy: FillPolicy,
    pub mode: IngestMode,
}

impl Default for FreezeOptions {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            limit: None,
            policy: FillPolicy::Symmetric,
            mode: IngestMode::Overwrite,
        }
    }
}

/// Dense ids for every labelled pair-store id, in ascending original id order
fn dense_labels(pairs: &PairStore) -> Result<(LabelIndex, HashMap<u32, u32>)> {
    let labels = pairs.labels();
    if labels.is_empty() && !pairs.is_empty() {
        return Err(StoreError::LabelMismatch(
            "pair store carries no labels to lay out a matrix".to_string(),
        ));
    }
    let mut dense = LabelIndex::new();
    let mut positions = HashMap::with_capacity(labels.len());
    for (position, (id, label)) in labels.iter().enumerate() {
        dense.insert(label, position as u32)?;
        positions.insert(id, position as u32);
    }
    Ok((dense, positions))
}

/// Reuse an existing matrix at `path` when its layout matches, otherwise create one
fn prepare_matrix(path: &Path, labels: LabelIndex, precision: u16, policy: FillPolicy) -> Result<MatrixStore> {
    let existing = match File::open(path) {
        Ok(file) => {
            let mut magic = [0u8; 8];
            match read_prefix(&file, &mut magic)? {
                0 => None,
                n => Some(detect_store_kind(&magic[..n])),
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    match existing {
        None => MatrixStore::create(path, labels, precision, policy),
        Some(Some(StoreKind::Matrix)) => {
            let matrix = MatrixStore::open_writable(path)?;
            if matrix.labels() != &labels {
                return Err(StoreError::LabelMismatch(format!(
                    "existing matrix {} has {} labels that differ from the pair store's {}",
                    path.display(),
                    matrix.labels().len(),
                    labels.len()
                )));
            }
            if matrix.precision().value() != precision {
                return Err(StoreError::IncompatiblePrecision {
                    left: matrix.precision().value(),
                    right: precision,
                });
            }
            if matrix.fill_policy() != policy {
                return Err(StoreError::InvalidFormatRequest(format!(
                    "existing matrix was filled {:?}, requested {:?}",
                    matrix.fill_policy(),
                    policy
                )));
            }
            info!(path = %path.display(), "continuing to fill existing matrix");
            Ok(matrix)
        }
        Some(_) => Err(StoreError::InvalidFormatRequest(format!(
            "refusing to overwrite {} which is not a frozen matrix",
            path.display()
        ))),
    }
}

impl MatrixStore {
    /// Freeze a pair store into a dense matrix at `path`.
    ///
    /// An existing matrix at `path` with the same labels keeps its cells and
    /// receives the new pairs under `options.mode`.
    pub fn from_pairs<P: AsRef<Path>>(path: P, pairs: &PairStore, options: &FreezeOptions) -> Result<MatrixStore> {
        let path = path.as_ref();
        let (labels, positions) = dense_labels(pairs)?;
        let precision = pairs.precision();
        let mut matrix = prepare_matrix(path, labels, precision.value(), options.policy)?;

        let position = |id: u32| positions.get(&id).copied().ok_or(StoreError::IdNotFound(id));
        let mut remaining = options.limit.unwrap_or(u64::MAX);
        let mut self_pairs = 0u64;
        let mut consumed = 0u64;

        for (frame_number, frame) in pairs.frames(options.frame_size).enumerate() {
            if remaining == 0 {
                break;
            }
            let mut frame = frame?;
            if (frame.len() as u64) > remaining {
                frame.truncate(remaining as usize);
            }
            remaining -= frame.len() as u64;
            consumed += frame.len() as u64;

            // row → [(col, score)] in stream order
            let mut rows: BTreeMap<u32, Vec<(u32, u16)>> = BTreeMap::new();
            for PairRecord { a, b, score } in frame {
                let (i, j) = (position(a)?, position(b)?);
                if i == j {
                    self_pairs += 1;
                    continue;
                }
                match options.policy {
                    FillPolicy::Symmetric => {
                        rows.entry(i).or_default().push((j, score));
                        rows.entry(j).or_default().push((i, score));
                    }
                    FillPolicy::UpperTriangleOnly => rows.entry(i.min(j)).or_default().push((i.max(j), score)),
                    FillPolicy::LowerTriangleOnly => rows.entry(i.max(j)).or_default().push((i.min(j), score)),
                }
            }

            let touched = rows.len();
            for (row, cells) in rows {
                let mut current = matrix.read_row(row as usize)?;
                for (col, score) in cells {
                    let cell = &mut current[col as usize];
                    *cell = match options.mode {
                        IngestMode::Overwrite => score,
                        IngestMode::Accumulate => cell.saturating_add(score).min(precision.value()),
                    };
                }
                matrix.write_row(row as usize, &current)?;
            }
            info!(frame = frame_number, pairs = consumed, rows = touched, "filled matrix frame");
        }

        if self_pairs > 0 {
            warn!(count = self_pairs, "skipped self pairs while freezing");
        }
        matrix.finish()?;
        MatrixStore::open(path)
    }

    /// Write the populated triangle of this matrix into `out`, returning the pairs written.
    ///
    /// `out` receives this matrix's labels with dense ids as pair ids.
    pub fn to_pairs(&self, out: &mut PairStore) -> Result<u64> {
        if out.precision() != self.precision() {
            return Err(StoreError::IncompatiblePrecision {
                left: out.precision().value(),
                right: self.precision().value(),
            });
        }
        if out.labels().is_empty() {
            out.set_labels(self.labels().clone())?;
        } else if out.labels() != self.labels() {
            return Err(StoreError::LabelMismatch(
                "output pair store already holds different labels".to_string(),
            ));
        }

        let policy = self.fill_policy();
        let mut written = 0;
        for (row, cells) in self.iter_rows().enumerate() {
            let cells = cells?;
            let records: Vec<PairRecord> = cells
                .iter()
                .enumerate()
                .filter(|&(col, &raw)| {
                    raw != 0
                        && match policy {
                            FillPolicy::Symmetric | FillPolicy::UpperTriangleOnly => col > row,
                            FillPolicy::LowerTriangleOnly => col < row,
                        }
                })
                .map(|(col, &raw)| PairRecord::new(row as u32, col as u32, raw))
                .collect();
            if !records.is_empty() {
                debug!(row, pairs = records.len(), "thawed row");
                written += out.append_records(records)?;
            }
        }
        out.flush()?;
        info!(pairs = written, order = self.len(), "thawed matrix");
        Ok(written)
    }
}
