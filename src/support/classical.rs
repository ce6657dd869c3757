//! Classical (Felsenstein) bootstrap support: the fraction of bootstrap
//! trees containing exactly the bipartition of a reference branch.

use super::{Progress, Reference, ResultSink, Supporter};
use crate::error::{SupportError, TreeError};
use crate::snapshot::TreeSnapshot;
use crate::tree::Tree;

#[derive(Debug, Default)]
pub struct ClassicalSupporter {
    progress: Progress,
}

impl ClassicalSupporter {
    pub fn new() -> Self {
        ClassicalSupporter::default()
    }
}

impl Supporter for ClassicalSupporter {
    type Scratch = ();

    fn new_scratch(&self, _reference: &Reference) -> Result<(), SupportError> {
        Ok(())
    }

    /// Sends 1 for every internal reference edge found in `bootstrap`, 0
    /// otherwise. Tip edges of `bootstrap` are looked up too: a reference
    /// edge under a degree 2 root can isolate a single leaf.
    fn compute_value(
        &self,
        reference: &Reference,
        _scratch: &mut (),
        bootstrap: &mut Tree,
        sink: &ResultSink,
    ) -> Result<(), SupportError> {
        bootstrap.reinit_indexes()?;
        reference.tree().compare_tip_indexes(bootstrap)?;
        let snapshot = TreeSnapshot::from_tree(bootstrap, true)?;

        for i in 0..reference.len() {
            if reference.is_tip_edge(i) {
                continue;
            }
            let bitset = reference
                .edge(i)
                .bitset()
                .ok_or(TreeError::BitsetsNotInitialized)?;
            let found = snapshot.contains(bitset);
            sink.value(i, if found { 1.0 } else { 0.0 });
        }
        Ok(())
    }

    fn finalize(&self, mean: f64, _topo_depth: usize) -> Option<f64> {
        Some(mean)
    }

    fn state(&self) -> &Progress {
        &self.progress
    }
}
