//! Bulk similarity generation
//!
//! Streams [`similarities`] into a TSV writer or a pair store, and answers
//! ad-hoc "what resembles this fragment" questions straight from fingerprints.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::error::{Result, StoreError};
use crate::labels::LabelIndex;
use crate::pairs::{PairStore, PairStoreOptions};
use crate::quantize::DEFAULT_PRECISION;
use crate::similarity::{similarities, Corrections, FillPolicy, FingerprintSet, ScoredPair};

/// Pairs buffered before each append to a pair store
const WRITE_BATCH: usize = 10_000;

/// Column header of every pair TSV
pub const TSV_HEADER: &str = "frag_id1\tfrag_id2\tscore";

/// Where generated pairs go
pub enum PairsTarget<'a> {
    /// Tab separated `label1 label2 score` lines with a header
    Tsv(&'a mut dyn Write),
    /// A new pair store at `path`; `"-"` is rejected
    Store {
        path: &'a str,
        /// Label → id translation; `None` assigns ids in label order
        label2id: Option<&'a LabelIndex>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DumpOptions {
    pub mean_onbit_density: f64,
    pub cutoff: f64,
    pub policy: FillPolicy,
    pub precision: u16,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            mean_onbit_density: 0.01,
            cutoff: 0.45,
            policy: FillPolicy::Symmetric,
            precision: DEFAULT_PRECISION,
        }
    }
}

/// Score `left × right` and write every pair at or above the cutoff. Returns pairs written.
pub fn dump_pairs(
    left: &FingerprintSet,
    right: &FingerprintSet,
    target: PairsTarget<'_>,
    options: &DumpOptions,
) -> Result<u64> {
    let corrections = Corrections::from_density(options.mean_onbit_density);
    let pairs = similarities(left, right, corrections, options.cutoff, options.policy)?;
    info!(
        left = left.len(),
        right = right.len(),
        cutoff = options.cutoff,
        "generating pairs"
    );

    match target {
        PairsTarget::Tsv(out) => {
            writeln!(out, "{}", TSV_HEADER)?;
            let mut written = 0u64;
            for pair in pairs {
                let pair = pair?;
                writeln!(out, "{}\t{}\t{}", pair.label1, pair.label2, pair.score)?;
                written += 1;
            }
            out.flush()?;
            info!(pairs = written, "wrote pairs as TSV");
            Ok(written)
        }
        PairsTarget::Store { path, label2id } => {
            if path == "-" {
                return Err(StoreError::InvalidFormatRequest(
                    "a pair store cannot be written to stdout".to_string(),
                ));
            }
            let labels = match label2id {
                Some(labels) => labels.clone(),
                None => LabelIndex::from_labels(union_labels(left, right))?,
            };

            let expected_rows = (left.len() as f64 * right.len() as f64 * options.cutoff * 0.025) as u64;
            let mut store = PairStore::create_with(
                Path::new(path),
                PairStoreOptions {
                    precision: options.precision,
                    expected_rows,
                },
            )?;
            store.set_labels(labels.clone())?;

            let mut written = 0u64;
            let mut batch = Vec::with_capacity(WRITE_BATCH);
            for pair in pairs {
                batch.push(pair?);
                if batch.len() == WRITE_BATCH {
                    written += store.append_pairs(batch.drain(..), &labels)?;
                }
            }
            written += store.append_pairs(batch, &labels)?;

            store.add_indexes()?;
            store.close()?;
            info!(pairs = written, path, "wrote pair store");
            Ok(written)
        }
    }
}

fn union_labels(left: &FingerprintSet, right: &FingerprintSet) -> BTreeSet<String> {
    left.iter().chain(right.iter()).map(|(label, _)| label.clone()).collect()
}

/// Score `query` against every fingerprint in `set`, best first.
///
/// An exact label match queries that one fingerprint; otherwise every label
/// starting with `query` is used. Self pairs are excluded.
pub fn similarity_to_query(
    set: &FingerprintSet,
    query: &str,
    cutoff: f64,
    mean_onbit_density: f64,
) -> Result<Vec<ScoredPair>> {
    let queries = match set.get(query) {
        Some(bits) => {
            let mut queries = FingerprintSet::new(set.number_of_bits());
            queries.insert(query, bits.clone());
            queries
        }
        None => set.filter(|label| label.starts_with(query)),
    };
    if queries.is_empty() {
        return Err(StoreError::LabelNotFound(query.to_string()));
    }

    let corrections = Corrections::from_density(mean_onbit_density);
    let mut hits = similarities(&queries, set, corrections, cutoff, FillPolicy::Symmetric)?
        .collect::<Result<Vec<_>, _>>()?;
    hits.sort_by(|x, y| y.score.total_cmp(&x.score));
    Ok(hits)
}
