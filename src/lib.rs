//! Crate root: module orchestration and public re-exports.
//!
//! Modules:
//! - `tree`: arena tree with oriented edges, tip index and edge bitsets.
//! - `topology`: rerooting, pruning, grafting, collapsing and comparisons.
//! - `bitset`: compact bitset representation for tree bipartitions.
//! - `snapshot`: hashed bipartition sets for exact split lookups.
//! - `support`: concurrent support engine with the Booster (TBE) and
//!   classical supporters.
//! - `io`: tree file reading and TSV reports.
//! - `api`: Python bindings via `pyo3` (gated behind "python" feature).

pub mod bitset;
pub mod error;
pub mod io;
pub mod snapshot;
pub mod support;
mod topology;
pub mod tree;

#[cfg(feature = "python")]
pub mod api;

pub use bitset::Bitset;
pub use error::{SupportError, TreeError};
pub use snapshot::TreeSnapshot;
pub use support::{BoosterConfig, BootstrapItem, SupportReport, compute_support};
pub use tree::{EdgeId, NodeId, Tree};
