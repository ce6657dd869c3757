//! Python binding layer.
//!
//! Trees cross the boundary as Newick strings. Support functions return one
//! `(edge index, topological depth, support)` tuple per reference edge, in
//! pre-order.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::support::{self, BoosterConfig, BootstrapItem, SupportReport};
use crate::tree::Tree;

type EdgeSupport = (usize, usize, Option<f64>);

fn parse_reference(newick: &str) -> PyResult<Tree> {
    Tree::from_newick(newick).map_err(|e| PyValueError::new_err(format!("Invalid reference tree: {e}")))
}

/// Unparsable bootstrap strings become error items and are skipped.
fn bootstrap_items(newicks: Vec<String>) -> Vec<BootstrapItem> {
    newicks
        .into_iter()
        .enumerate()
        .map(|(id, s)| match Tree::from_newick(&s) {
            Ok(tree) => BootstrapItem::Tree { id, tree },
            Err(error) => BootstrapItem::Error { id, error },
        })
        .collect()
}

fn edge_supports(tree: &Tree, report: &SupportReport) -> PyResult<Vec<EdgeSupport>> {
    if report.trees_processed == 0 {
        return Err(PyValueError::new_err("No bootstrap tree could be compared"));
    }
    tree.edges()
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let depth = tree[e]
                .topo_depth()
                .map_err(|err| PyValueError::new_err(err.to_string()))?;
            Ok((i, depth, tree[e].support()))
        })
        .collect()
}

/// Transfer bootstrap expectation of every branch of a reference tree.
///
/// Args:
///     reference: Newick string of the reference tree
///     bootstraps: List of Newick strings, one per bootstrap tree
///     threads: Number of worker threads, 0 for one per core (default: 0)
///     normalize: Return 1 - mean/(depth - 1) instead of the raw mean
///         transfer distance (default: True)
///
/// Returns:
///     A list of (edge_index, depth, support) tuples; support is None for
///     tip edges and edges of depth 1 when normalized
///
/// Raises:
///     ValueError: If a tree cannot be parsed or the tip sets differ
#[pyfunction]
#[pyo3(signature = (reference, bootstraps, threads=0, normalize=true))]
fn booster_support(
    py: Python<'_>,
    reference: String,
    bootstraps: Vec<String>,
    threads: usize,
    normalize: bool,
) -> PyResult<Vec<EdgeSupport>> {
    let mut tree = parse_reference(&reference)?;
    let config = BoosterConfig {
        normalize_by_expected: normalize,
        ..BoosterConfig::default()
    };
    let report = py
        .detach(|| support::booster(&mut tree, bootstrap_items(bootstraps), threads, config))
        .map_err(|e| PyValueError::new_err(format!("Failed to compute supports: {e}")))?;
    edge_supports(&tree, &report)
}

/// Classical bootstrap support of every branch of a reference tree.
///
/// Args:
///     reference: Newick string of the reference tree
///     bootstraps: List of Newick strings, one per bootstrap tree
///     threads: Number of worker threads, 0 for one per core (default: 0)
///
/// Returns:
///     A list of (edge_index, depth, support) tuples; support is None for
///     tip edges
///
/// Raises:
///     ValueError: If a tree cannot be parsed or the tip sets differ
#[pyfunction]
#[pyo3(signature = (reference, bootstraps, threads=0))]
fn classical_support(
    py: Python<'_>,
    reference: String,
    bootstraps: Vec<String>,
    threads: usize,
) -> PyResult<Vec<EdgeSupport>> {
    let mut tree = parse_reference(&reference)?;
    let report = py
        .detach(|| support::classical(&mut tree, bootstrap_items(bootstraps), threads))
        .map_err(|e| PyValueError::new_err(format!("Failed to compute supports: {e}")))?;
    edge_supports(&tree, &report)
}

/// Python module definition
#[pymodule]
#[pyo3(name = "booster_support")]
fn booster_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(booster_support, m)?)?;
    m.add_function(wrap_pyfunction!(classical_support, m)?)?;
    Ok(())
}
