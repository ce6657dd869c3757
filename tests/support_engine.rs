use std::sync::mpsc::sync_channel;
use std::thread;

use booster_support::support::{
    self, BoosterConfig, BootstrapItem, ClassicalSupporter, Progress, Reference, ResultSink, Supporter,
    TransferReport, compute_support,
};
use booster_support::{SupportError, Tree, TreeError};
use pretty_assertions::assert_eq;

fn item(id: usize, newick: &str) -> BootstrapItem {
    BootstrapItem::Tree {
        id,
        tree: Tree::from_newick(newick).unwrap(),
    }
}

/// Supports of the internal edges, by the sorted tip names below them
fn internal_supports(tree: &Tree) -> Vec<(String, Option<f64>)> {
    let names = tree.tip_names_by_index();
    let mut supports: Vec<(String, Option<f64>)> = tree
        .internal_edges()
        .into_iter()
        .map(|e| {
            let below: Vec<&str> = tree[e]
                .bitset()
                .unwrap()
                .iter_ones()
                .map(|i| names[i].as_str())
                .collect();
            (below.join(","), tree[e].support())
        })
        .collect();
    supports.sort_by(|a, b| a.0.cmp(&b.0));
    supports
}

fn assert_close(actual: Option<f64>, expected: f64) {
    let actual = actual.unwrap();
    assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
}

/// Bootstrap trees fed through a bounded channel by a producer thread, the
/// way the file reader does.
#[test]
fn booster_from_channel_stream() {
    let mut reference = Tree::from_newick("((A,B),(C,D));").unwrap();
    let (sender, receiver) = sync_channel(1);
    let producer = thread::spawn(move || {
        for (id, newick) in ["((A,B),(C,D));", "((A,C),(B,D));", "((B,A),(D,C));"].iter().enumerate() {
            sender.send(item(id, newick)).unwrap();
        }
    });

    let report = support::booster(&mut reference, receiver, 2, BoosterConfig::default()).unwrap();
    producer.join().unwrap();

    assert_eq!(report.trees_processed, 3);
    assert_eq!(report.trees_skipped, 0);
    // Both root edges carry the {A,B}|{C,D} split, depth 2: 1 - (1/3)/1
    for (_, support) in internal_supports(&reference) {
        assert_close(support, 2.0 / 3.0);
    }
    for e in reference.tip_edges() {
        assert_eq!(reference[e].support(), None);
    }
}

#[test]
fn booster_raw_mean_distance() {
    let mut reference = Tree::from_newick("((A,B),(C,D));").unwrap();
    let boots = vec![item(0, "((A,B),(C,D));"), item(1, "((A,C),(B,D));"), item(2, "((A,B),(C,D));")];
    let config = BoosterConfig {
        normalize_by_expected: false,
        ..BoosterConfig::default()
    };
    support::booster(&mut reference, boots, 3, config).unwrap();
    for (_, support) in internal_supports(&reference) {
        assert_close(support, 1.0 / 3.0);
    }
}

#[test]
fn unreadable_replicates_are_skipped() {
    let mut reference = Tree::from_newick("((A,B),C,(D,E));").unwrap();
    let boots = vec![
        item(0, "((A,B),C,(D,E));"),
        BootstrapItem::Error {
            id: 1,
            error: TreeError::Newick("unexpected end".into()),
        },
        item(2, "((A,B),C,(D,E));"),
    ];
    let report = support::booster(&mut reference, boots, 2, BoosterConfig::default()).unwrap();
    assert_eq!(report.trees_processed, 2);
    assert_eq!(report.trees_skipped, 1);
    for (_, support) in internal_supports(&reference) {
        assert_close(support, 1.0);
    }
}

#[test]
fn different_tip_set_is_fatal() {
    let mut reference = Tree::from_newick("((A,B),C,(D,E));").unwrap();
    let boots = vec![item(0, "((A,B),C,(D,E));"), item(1, "((A,B),C,(D,F));")];
    let err = support::booster(&mut reference, boots, 1, BoosterConfig::default()).unwrap_err();
    assert_eq!(err, SupportError::Tree(TreeError::DifferentTipSets));
}

#[test]
fn unindexed_reference_is_rejected() {
    let mut reference = Tree::new();
    let err = support::classical(&mut reference, Vec::new(), 1).unwrap_err();
    assert!(matches!(err, SupportError::Tree(_)));
}

/// Star over `names`, tip index built but bitsets never allocated
fn star_without_bitsets(names: &[&str]) -> Tree {
    let mut tree = Tree::new();
    let root = tree.new_node();
    for name in names {
        let tip = tree.new_named_node(*name);
        tree.connect_nodes(root, tip);
    }
    tree.set_root(root);
    tree.update_tip_index().unwrap();
    tree
}

#[test]
fn rejected_reference_keeps_its_edge_ids() {
    let mut reference = star_without_bitsets(&["A", "B", "C"]);
    let err = support::booster(&mut reference, Vec::new(), 1, BoosterConfig::default()).unwrap_err();
    assert_eq!(err, SupportError::Tree(TreeError::BitsetsNotInitialized));
    for e in reference.edges() {
        assert_eq!(reference[e].id(), None);
    }
}

#[test]
fn duplicate_tip_names_in_a_replicate_are_fatal() {
    let boot = {
        let mut tree = Tree::new();
        let root = tree.new_node();
        for name in ["A", "B", "B", "D"] {
            let tip = tree.new_named_node(name);
            tree.connect_nodes(root, tip);
        }
        tree.set_root(root);
        tree
    };
    for classical in [false, true] {
        let mut reference = Tree::from_newick("((A,B),C,D);").unwrap();
        let boots = vec![
            item(0, "((A,B),C,D);"),
            BootstrapItem::Tree {
                id: 1,
                tree: boot.clone(),
            },
        ];
        let err = if classical {
            support::classical(&mut reference, boots, 1)
        } else {
            support::booster(&mut reference, boots, 1, BoosterConfig::default())
        }
        .unwrap_err();
        assert_eq!(err, SupportError::Tree(TreeError::DuplicateTipName("B".into())));
    }
}

#[test]
fn classical_and_booster_agree_on_exact_matches() {
    let newicks = ["((A,B),C,((D,E),F));", "((A,B),C,((D,F),E));", "((A,C),B,((D,E),F));"];
    let boots = || newicks.iter().enumerate().map(|(id, s)| item(id, s)).collect::<Vec<_>>();

    let mut classical = Tree::from_newick(newicks[0]).unwrap();
    support::classical(&mut classical, boots(), 2).unwrap();
    let classical = internal_supports(&classical);
    assert_eq!(classical.len(), 3);
    for (split, support) in &classical {
        let expected = match split.as_str() {
            "A,B" | "D,E" => 2.0 / 3.0,
            "D,E,F" => 1.0,
            other => panic!("unexpected split {other}"),
        };
        assert_close(*support, expected);
    }

    // Exact matches are exactly the bootstrap trees at transfer distance 0
    let mut booster = Tree::from_newick(newicks[0]).unwrap();
    let config = BoosterConfig {
        normalize_by_expected: false,
        ..BoosterConfig::default()
    };
    support::booster(&mut booster, boots(), 2, config).unwrap();
    for ((split, distance), (_, fraction)) in internal_supports(&booster).into_iter().zip(&classical) {
        let mean = distance.unwrap();
        if fraction.unwrap() == 1.0 {
            assert_eq!(mean, 0.0, "{split}");
        } else {
            assert!(mean > 0.0, "{split}");
        }
    }
}

#[test]
fn side_reports_follow_the_config() {
    let mut reference = Tree::from_newick("(((A,B),C),(D,E),F);").unwrap();
    let boots = vec![item(0, "(((A,B),C),(D,E),F);"), item(1, "(((A,C),B),(D,E),F);")];
    let config = BoosterConfig {
        moved_species: true,
        transfer_per_branch: TransferReport::All,
        ..BoosterConfig::default()
    };
    let report = support::booster(&mut reference, boots, 2, config).unwrap();

    let moved = report.moved_species.unwrap();
    let names: Vec<&str> = moved.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "C", "D", "E", "F"]);
    assert!(moved.iter().all(|(_, f)| (0.0..=1.0).contains(f)));

    let branches = report.taxa_per_branch.unwrap();
    assert_eq!(branches.len(), reference.edges().len());
    let moved_taxa: usize = branches.iter().map(|b| b.taxa.len()).sum();
    assert!(moved_taxa > 0);

    let mut plain = Tree::from_newick("(((A,B),C),(D,E),F);").unwrap();
    let report = support::booster(&mut plain, vec![item(0, "(((A,B),C),(D,E),F);")], 1, BoosterConfig::default())
        .unwrap();
    assert_eq!(report.moved_species, None);
    assert_eq!(report.taxa_per_branch, None);
}

/// Emits 1 on every internal edge and asks the engine to stop while the
/// second tree is being compared.
#[derive(Default)]
struct StopAfterTwo {
    progress: Progress,
}

impl Supporter for StopAfterTwo {
    type Scratch = ();

    fn new_scratch(&self, _reference: &Reference) -> Result<(), SupportError> {
        Ok(())
    }

    fn compute_value(
        &self,
        reference: &Reference,
        _scratch: &mut (),
        _bootstrap: &mut Tree,
        sink: &ResultSink,
    ) -> Result<(), SupportError> {
        for i in (0..reference.len()).filter(|&i| !reference.is_tip_edge(i)) {
            sink.value(i, 1.0);
        }
        if self.progress.processed() == 1 {
            self.cancel();
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

#[test]
fn cancel_stops_before_the_next_tree() {
    let mut reference = Tree::from_newick("((A,B),(C,D));").unwrap();
    let boots: Vec<BootstrapItem> = (0..10).map(|id| item(id, "((A,B),(C,D));")).collect();
    let supporter = StopAfterTwo::default();

    let report = compute_support(&mut reference, boots, 1, &supporter).unwrap();
    assert_eq!(report.trees_processed, 2);
    assert_eq!(supporter.progress(), 2);
    assert!(supporter.canceled());
    for (_, support) in internal_supports(&reference) {
        assert_close(support, 1.0);
    }
}

#[test]
fn engine_state_is_reset_between_runs() {
    let supporter = ClassicalSupporter::new();
    for _ in 0..2 {
        let mut reference = Tree::from_newick("((A,B),(C,D),E);").unwrap();
        let boots = vec![item(0, "((A,B),(C,D),E);"), item(1, "((A,C),(B,D),E);")];
        let report = compute_support(&mut reference, boots, 2, &supporter).unwrap();
        assert_eq!(report.trees_processed, 2);
        assert_eq!(supporter.progress(), 2);
    }
}
