//! Fragsim: fragment fingerprint similarity, stored sparse or frozen dense
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CLI (clap, fragsim)                     │
//! │     generate · import · freeze · thaw · similar · export    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Text interchange (tsv) + ToolConfig            │
//! │      pair TSV · fpneigh · makebits · JSON label maps        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        fragsim-core                         │
//! │     similarity · PairStore · MatrixStore · open_any         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod tsv;

pub use config::ToolConfig;
pub use fragsim_core::*;
