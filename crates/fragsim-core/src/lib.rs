//! Fragsim Core – Modified-Tanimoto similarity, sparse pair stores and frozen dense matrices
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Query façade (open_any)                     │
//! │        find(label, cutoff, limit) over either store         │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │   PairStore (.fsp sparse)    │  MatrixStore (.fsm dense)    │
//! │   append · index · merge     │  LZ4 rows · mmap reads       │
//! │              └──── freeze / thaw (framed) ────┘             │
//! ├─────────────────────────────────────────────────────────────┤
//! │     Similarity kernel · quantization · label index          │
//! ├─────────────────────────────────────────────────────────────┤
//! │      FingerprintStore (sorted key-value file, BitSet)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bitset;
pub mod error;
pub mod fingerprints;
pub mod format;
pub mod freeze;
pub mod generate;
pub mod kv;
pub mod labels;
pub mod matrix;
pub mod pairs;
pub mod quantize;
pub mod query;
pub mod similarity;

pub use bitset::BitSet;
pub use error::StoreError;
pub use fingerprints::FingerprintStore;
pub use freeze::{FreezeOptions, IngestMode};
pub use labels::LabelIndex;
pub use matrix::{MatrixStore, Triangle};
pub use pairs::{merge_pair_stores, OpenMode, PairStore};
pub use quantize::{Precision, ScoreAxis};
pub use query::{open_any, AnyStore, SimilarityIndex};
pub use similarity::{similarities, similarity, Corrections, FillPolicy, FingerprintSet, ScoredPair};
