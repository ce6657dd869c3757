//! Tree file input and TSV report output.
//!
//! Bootstrap files are read by a background thread that parses one tree at a
//! time and sends it on a bounded channel, so that support workers start
//! before the whole file is read. Paths ending in `.gz` are transparently
//! (de)compressed.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use itertools::Itertools;
use tracing::{debug, info};

use crate::error::TreeError;
use crate::support::{BootstrapItem, BranchTransfers};
use crate::tree::Tree;

/// Trees parsed ahead of the workers
const STREAM_BOUND: usize = 64;

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

fn open_input(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if is_gz(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Report file, gzip-compressed when its path ends in `.gz`.
/// Must be closed with [`Output::finish`] to write the gzip trailer.
enum Output {
    Plain(BufWriter<File>),
    Gz(BufWriter<GzEncoder<File>>),
}

impl Output {
    fn finish(self) -> io::Result<()> {
        match self {
            Output::Plain(mut w) => w.flush(),
            Output::Gz(w) => {
                w.into_inner().map_err(io::IntoInnerError::into_error)?.finish()?;
                Ok(())
            }
        }
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::Plain(w) => w.write(buf),
            Output::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Plain(w) => w.flush(),
            Output::Gz(w) => w.flush(),
        }
    }
}

fn create_output(path: &Path) -> io::Result<Output> {
    let file = File::create(path)?;
    if is_gz(path) {
        Ok(Output::Gz(BufWriter::new(GzEncoder::new(file, Compression::default()))))
    } else {
        Ok(Output::Plain(BufWriter::new(file)))
    }
}

fn invalid_data(e: TreeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Strip bracketed annotations and unquoted whitespace from Newick strings.
///
/// BEAST and NEXUS writers add comments like `:[&rate=0.123]2.45` or a
/// leading `[&R]`, and trees often span several lines; the parser accepts
/// neither.
fn strip_annotations(newick: &str) -> String {
    let mut result = String::with_capacity(newick.len());
    let mut in_annotation = false;
    let mut quote: Option<char> = None;
    let mut chars = newick.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_annotation {
            in_annotation = ch != ']';
            continue;
        }
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                result.push(c);
            }
            (Some(_), c) => result.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                result.push(ch);
            }
            (None, '[') if chars.peek() == Some(&'&') => in_annotation = true,
            (None, c) if c.is_whitespace() => {}
            (None, c) => result.push(c),
        }
    }

    result
}

/// Read the first Newick tree of a file, indexed.
pub fn read_tree<P: AsRef<Path>>(path: P) -> io::Result<Tree> {
    let mut content = String::new();
    open_input(path.as_ref())?.read_to_string(&mut content)?;
    let newick = match content.find(';') {
        Some(end) => &content[..=end],
        None => content.as_str(),
    };
    Tree::from_newick(&strip_annotations(newick)).map_err(invalid_data)
}

/// Stream the trees of a bootstrap file from a background thread.
///
/// The file holds Newick trees separated by `;`, or a NEXUS `TREES` block
/// when `nexus` is true. Trees that fail to parse are sent as
/// [`BootstrapItem::Error`]. The thread stops early when the receiver is
/// dropped and returns the number of trees sent.
pub fn read_bootstrap_trees<P: AsRef<Path>>(
    path: P,
    nexus: bool,
) -> io::Result<(Receiver<BootstrapItem>, JoinHandle<io::Result<usize>>)> {
    let input = open_input(path.as_ref())?;
    let (sender, receiver) = sync_channel(STREAM_BOUND);
    let name = path.as_ref().display().to_string();
    let handle = thread::Builder::new()
        .name("bootstrap-reader".into())
        .spawn(move || {
            let sent = if nexus {
                stream_nexus(input, &sender)?
            } else {
                stream_newick(input, &sender)?
            };
            info!(file = %name, trees = sent, "bootstrap file read");
            Ok(sent)
        })?;
    Ok((receiver, handle))
}

fn parse_item(id: usize, newick: &str) -> BootstrapItem {
    match Tree::from_newick(&strip_annotations(newick)) {
        Ok(tree) => BootstrapItem::Tree { id, tree },
        Err(error) => BootstrapItem::Error { id, error },
    }
}

fn stream_newick(mut input: Box<dyn BufRead + Send>, sender: &SyncSender<BootstrapItem>) -> io::Result<usize> {
    let mut buf = Vec::new();
    let mut id = 0;
    loop {
        buf.clear();
        if input.read_until(b';', &mut buf)? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf);
        let newick = text.trim();
        if newick.is_empty() {
            continue;
        }
        if sender.send(parse_item(id, newick)).is_err() {
            debug!(sent = id, "bootstrap consumer gone");
            break;
        }
        id += 1;
    }
    Ok(id)
}

fn stream_nexus(mut input: Box<dyn BufRead + Send>, sender: &SyncSender<BootstrapItem>) -> io::Result<usize> {
    let mut content = String::new();
    input.read_to_string(&mut content)?;
    let mut sent = 0;
    for item in nexus_items(&content) {
        if sender.send(item).is_err() {
            debug!(sent, "bootstrap consumer gone");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

struct TreeBlock<'a> {
    header: &'a str,
    body: &'a str,
}

fn collect_tree_blocks(content: &str) -> Vec<TreeBlock<'_>> {
    content
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.to_ascii_uppercase().starts_with("TREE "))
        .take_while(|line| !line.to_ascii_uppercase().starts_with("END;"))
        .filter_map(|line| {
            let (header, body) = line.split_once('=')?;
            Some(TreeBlock {
                header: header.trim(),
                body: body.trim(),
            })
        })
        .collect()
}

/// TRANSLATE entries, token → taxon name
///
/// ```text
/// translate
///     1 '1959.M.CD.59.ZR59',
///     2 '1960.DRC60A';
/// ```
fn parse_taxon_block(content: &str) -> HashMap<String, String> {
    let mut taxons = HashMap::new();
    let lines = content
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.to_ascii_uppercase().starts_with("TRANSLATE"))
        .skip(1);
    for line in lines {
        if line.starts_with(';') {
            break;
        }
        let last = line.ends_with(';');
        let mut parts = line.trim_end_matches([',', ';']).split_whitespace();
        if let (Some(id), Some(label)) = (parts.next(), parts.next()) {
            taxons.insert(id.to_string(), label.trim_matches('\'').to_string());
        }
        if last {
            break;
        }
    }
    taxons
}

fn nexus_items(content: &str) -> Vec<BootstrapItem> {
    let taxons = parse_taxon_block(content);
    collect_tree_blocks(content)
        .into_iter()
        .enumerate()
        .map(|(id, block)| {
            debug!(replicate = id, header = block.header, "nexus tree");
            match parse_item(id, block.body) {
                BootstrapItem::Tree { id, mut tree } if !taxons.is_empty() => match tree.rename(&taxons) {
                    Ok(()) => BootstrapItem::Tree { id, tree },
                    Err(error) => BootstrapItem::Error { id, error },
                },
                item => item,
            }
        })
        .collect()
}

fn format_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

/// Write one line per edge of `tree`: edge index, topological depth, tips
/// below, length, support and child node name.
pub fn write_support_tsv<P: AsRef<Path>>(path: P, tree: &Tree) -> io::Result<()> {
    let mut out = create_output(path.as_ref())?;
    writeln!(out, "edge\tdepth\ttips_right\tlength\tsupport\tnode")?;
    for (i, e) in tree.edges().into_iter().enumerate() {
        let edge = &tree[e];
        let depth = edge.topo_depth().map_err(invalid_data)?;
        let tips = edge.num_tips_right().map_err(invalid_data)?;
        writeln!(
            out,
            "{i}\t{depth}\t{tips}\t{}\t{}\t{}",
            format_opt(edge.length()),
            format_opt(edge.support()),
            tree[edge.right()].name()
        )?;
    }
    out.finish()
}

/// Write the moved species report: one line per tip with its mean fraction.
pub fn write_moved_species_tsv<P: AsRef<Path>>(path: P, moved: &[(String, f64)]) -> io::Result<()> {
    let mut out = create_output(path.as_ref())?;
    writeln!(out, "taxon\tfraction")?;
    for (name, fraction) in moved {
        writeln!(out, "{name}\t{fraction}")?;
    }
    out.finish()
}

/// Write the taxa transferred across each reference branch, as
/// `taxon:fraction` pairs separated by commas.
pub fn write_taxa_per_branch_tsv<P: AsRef<Path>>(path: P, branches: &[BranchTransfers]) -> io::Result<()> {
    let mut out = create_output(path.as_ref())?;
    writeln!(out, "edge\ttaxa")?;
    for branch in branches {
        let taxa = branch
            .taxa
            .iter()
            .map(|(name, fraction)| format!("{name}:{fraction}"))
            .join(",");
        writeln!(out, "{}\t{taxa}", branch.edge)?;
    }
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("booster-io-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_strip_annotations() {
        assert_eq!(
            strip_annotations("[&R] ((A:[&rate=1]1,B:1):[&rate=2]2,\n  C:3);"),
            "((A:1,B:1):2,C:3);"
        );
        assert_eq!(strip_annotations("('a b',\"c d\");"), "('a b',\"c d\");");
    }

    #[test]
    fn test_nexus_items() {
        let content = "#NEXUS
begin trees;
    translate
        1 A,
        2 B,
        3 'C',
        4 D;
    tree STATE_0 = [&R] ((1:1,2:1):1,(3:1,4:1):1);
    tree STATE_1 = ((1,3),(2,4));
    tree STATE_2 = ((1,3),(2,4;
end;
";
        let items = nexus_items(content);
        assert_eq!(items.len(), 3);
        match &items[0] {
            BootstrapItem::Tree { id, tree } => {
                assert_eq!(*id, 0);
                assert_eq!(tree.sorted_tips(), vec!["A", "B", "C", "D"]);
            }
            other => panic!("expected a tree, got {other:?}"),
        }
        assert!(matches!(items[2], BootstrapItem::Error { id: 2, .. }));
    }

    #[test]
    fn test_stream_newick_gz() {
        let path = temp_path("boot.nwk.gz");
        {
            let mut out = create_output(&path).unwrap();
            write!(out, "((A,B),(C,D));\n((A,C),(B,D));\n((A,B),(C,D);\n((A,D),(B,C));\n").unwrap();
            out.finish().unwrap();
        }
        let (receiver, handle) = read_bootstrap_trees(&path, false).unwrap();
        let items: Vec<BootstrapItem> = receiver.into_iter().collect();
        assert_eq!(handle.join().unwrap().unwrap(), 4);
        assert_eq!(items.iter().map(BootstrapItem::id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        let errors = items.iter().filter(|i| matches!(i, BootstrapItem::Error { .. })).count();
        assert_eq!(errors, 1);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_read_tree_and_write_support() {
        let input = temp_path("ref.nwk");
        std::fs::write(&input, "((A:1,B:1)0.8:1,(C:1,D:1):1);\n").unwrap();
        let tree = read_tree(&input).unwrap();
        assert_eq!(tree.tip_count(), 4);

        let output = temp_path("support.tsv");
        write_support_tsv(&output, &tree).unwrap();
        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], "edge\tdepth\ttips_right\tlength\tsupport\tnode");
        assert!(lines.iter().any(|l| l.ends_with("\t0.8\t")));

        std::fs::remove_file(input).unwrap();
        std::fs::remove_file(output).unwrap();
    }

    #[test]
    fn test_gz_report_is_complete() {
        let output = temp_path("moved.tsv.gz");
        let moved: Vec<(String, f64)> = (0..500).map(|i| (format!("taxon{i}"), i as f64 / 500.0)).collect();
        write_moved_species_tsv(&output, &moved).unwrap();

        let mut written = String::new();
        open_input(&output).unwrap().read_to_string(&mut written).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 501);
        assert_eq!(lines[0], "taxon\tfraction");
        assert_eq!(lines[500], "taxon499\t0.998");
        std::fs::remove_file(output).unwrap();
    }

    #[test]
    fn test_write_taxa_per_branch() {
        let output = temp_path("taxa.tsv");
        let branches = vec![
            BranchTransfers {
                edge: 0,
                taxa: vec![("A".into(), 0.5), ("C".into(), 0.25)],
            },
            BranchTransfers { edge: 1, taxa: vec![] },
        ];
        write_taxa_per_branch_tsv(&output, &branches).unwrap();
        let written = std::fs::read_to_string(&output).unwrap();
        assert_eq!(written, "edge\ttaxa\n0\tA:0.5,C:0.25\n1\t\n");
        std::fs::remove_file(output).unwrap();
    }
}
