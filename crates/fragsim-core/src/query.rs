//! Format-agnostic similarity lookups
//!
//! [`open_any`] sniffs the header magic and hands back whichever store the
//! file holds behind one [`SimilarityIndex`] contract.

use std::fs::File;
use std::path::Path;

use crate::error::{Result, StoreError};
use crate::format::{detect_store_kind, read_prefix, StoreKind};
use crate::labels::LabelIndex;
use crate::matrix::{MatrixStore, Triangle};
use crate::pairs::{OpenMode, PairStore};
use crate::quantize::{Precision, ScoreHistogram};
use crate::similarity::{FillPolicy, ScoredPair};

/// Nearest-neighbour lookups shared by both store representations
pub trait SimilarityIndex {
    /// Labels scoring at least `cutoff` against `query`, best first, at most `limit`.
    ///
    /// Fails with a not-found error when `query` is unknown; a known label
    /// without hits yields an empty list.
    fn find(&self, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>>;

    fn labels(&self) -> &LabelIndex;

    fn precision(&self) -> Precision;

    /// Every stored pair as a labelled triple
    fn pairs(&self) -> Box<dyn Iterator<Item = Result<ScoredPair>> + '_>;

    /// Histogram of nonzero stored scores
    fn histogram(&self) -> Result<ScoreHistogram>;
}

impl SimilarityIndex for PairStore {
    fn find(&self, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        self.find_label(query, cutoff, limit)
    }

    fn labels(&self) -> &LabelIndex {
        PairStore::labels(self)
    }

    fn precision(&self) -> Precision {
        PairStore::precision(self)
    }

    fn pairs(&self) -> Box<dyn Iterator<Item = Result<ScoredPair>> + '_> {
        Box::new(self.iter())
    }

    fn histogram(&self) -> Result<ScoreHistogram> {
        self.count()
    }
}

impl SimilarityIndex for MatrixStore {
    fn find(&self, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        MatrixStore::find(self, query, cutoff, limit)
    }

    fn labels(&self) -> &LabelIndex {
        MatrixStore::labels(self)
    }

    fn precision(&self) -> Precision {
        MatrixStore::precision(self)
    }

    /// Populated-triangle cells in row order
    fn pairs(&self) -> Box<dyn Iterator<Item = Result<ScoredPair>> + '_> {
        let policy = self.fill_policy();
        let precision = self.precision();
        Box::new(self.iter_rows().enumerate().flat_map(move |(row, cells)| {
            let cells = match cells {
                Ok(cells) => cells,
                Err(e) => return vec![Err(e)],
            };
            cells
                .into_iter()
                .enumerate()
                .filter(|&(col, raw)| raw != 0 && populated(policy, row, col))
                .map(|(col, raw)| -> Result<ScoredPair> {
                    Ok(ScoredPair::new(
                        MatrixStore::labels(self).by_id(row as u32)?,
                        MatrixStore::labels(self).by_id(col as u32)?,
                        precision.dequantize(raw),
                    ))
                })
                .collect()
        }))
    }

    fn histogram(&self) -> Result<ScoreHistogram> {
        let triangle = match self.fill_policy() {
            FillPolicy::LowerTriangleOnly => Triangle::Lower,
            _ => Triangle::Upper,
        };
        self.count(triangle)
    }
}

fn populated(policy: FillPolicy, row: usize, col: usize) -> bool {
    match policy {
        FillPolicy::LowerTriangleOnly => col < row,
        _ => col > row,
    }
}

/// Either store, opened read-only
pub enum AnyStore {
    Pairs(PairStore),
    Matrix(MatrixStore),
}

impl AnyStore {
    pub fn kind(&self) -> StoreKind {
        match self {
            AnyStore::Pairs(_) => StoreKind::Pairs,
            AnyStore::Matrix(_) => StoreKind::Matrix,
        }
    }

    fn inner(&self) -> &dyn SimilarityIndex {
        match self {
            AnyStore::Pairs(store) => store,
            AnyStore::Matrix(store) => store,
        }
    }
}

impl SimilarityIndex for AnyStore {
    fn find(&self, query: &str, cutoff: f64, limit: Option<usize>) -> Result<Vec<(String, f64)>> {
        self.inner().find(query, cutoff, limit)
    }

    fn labels(&self) -> &LabelIndex {
        self.inner().labels()
    }

    fn precision(&self) -> Precision {
        self.inner().precision()
    }

    fn pairs(&self) -> Box<dyn Iterator<Item = Result<ScoredPair>> + '_> {
        self.inner().pairs()
    }

    fn histogram(&self) -> Result<ScoreHistogram> {
        self.inner().histogram()
    }
}

/// Open a store of either representation, detected from its header
pub fn open_any<P: AsRef<Path>>(path: P) -> Result<AnyStore> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let mut magic = [0u8; 8];
    let n = read_prefix(&file, &mut magic)?;
    drop(file);

    match detect_store_kind(&magic[..n]) {
        Some(StoreKind::Pairs) => Ok(AnyStore::Pairs(PairStore::open(path, OpenMode::Read)?)),
        Some(StoreKind::Matrix) => Ok(AnyStore::Matrix(MatrixStore::open(path)?)),
        None => Err(StoreError::corrupt(format!(
            "{} is neither a pair store nor a frozen matrix",
            path.display()
        ))),
    }
}
