use crate::config::Config;
use crate::error::{Error, Result};
use crate::infomap::Infomap;
use crate::tree::NodeId;
use log::{error, info};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

fn format_started_at(start_time: SystemTime) -> String {
    let dt: chrono::DateTime<chrono::Local> = start_time.into();
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `<out_dir>/<out_name>`, falling back to the network file stem.
fn output_base_path(cfg: &Config) -> PathBuf {
    let name = if cfg.out_name.is_empty() {
        cfg.network_file
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("infomap")
            .to_string()
    } else {
        cfg.out_name.clone()
    };
    cfg.out_dir.join(name)
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    Ok(BufWriter::new(file))
}

/// One line per leaf: the colon-joined module path, the leaf's position in
/// its module, its name and its input index. Nested instances are followed
/// through the modules that own them.
pub fn write_tree_lines<W: Write>(w: &mut W, infomap: &Infomap) -> io::Result<()> {
    write_children(w, infomap, infomap.tree().root(), infomap, "")
}

fn write_children<W: Write>(
    w: &mut W,
    instance: &Infomap,
    parent: NodeId,
    names: &Infomap,
    prefix: &str,
) -> io::Result<()> {
    let tree = instance.tree();
    for (i, &child) in tree.children(parent).iter().enumerate() {
        let node = tree.node(child);
        if node.is_leaf() {
            let original = node.original_index as usize;
            writeln!(w, "{}{} {} ({})", prefix, i, names.leaf_name(original), original)?;
            continue;
        }
        let sub_prefix = format!("{}{}:", prefix, i);
        match node.sub_structure.infomap.as_deref() {
            Some(sub) => write_children(w, sub, sub.tree().root(), names, &sub_prefix)?,
            None => write_children(w, instance, child, names, &sub_prefix)?,
        }
    }
    Ok(())
}

fn write_tree_file(
    path: &Path,
    infomap: &Infomap,
    started: &str,
    elapsed: Duration,
) -> io::Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    writeln!(
        w,
        "# Codelength {:.6} bits. Network size: {} nodes and {} links.",
        infomap.hierarchical_codelength(),
        infomap.num_leaf_nodes(),
        infomap.tree().num_leaf_edges()
    )?;
    writeln!(w, "# started at {}", started)?;
    writeln!(w, "# completed in {} s", elapsed.as_secs_f64())?;
    write_tree_lines(&mut w, infomap)?;
    w.flush()
}

/// `*Vertices n`, then `position originalIndex module` with 1-based modules.
pub fn write_clu<W: Write>(w: &mut W, infomap: &Infomap) -> io::Result<()> {
    let tree = infomap.tree();
    writeln!(w, "*Vertices {}", tree.num_leaf_nodes())?;
    let clusters = infomap.cluster_vector();
    for (i, (&leaf, module)) in tree.leaves().iter().zip(clusters).enumerate() {
        writeln!(w, "{} {} {}", i, tree.node(leaf).original_index, module + 1)?;
    }
    Ok(())
}

pub fn write_node_ranks<W: Write>(w: &mut W, infomap: &Infomap) -> io::Result<()> {
    let tree = infomap.tree();
    writeln!(w, "#node-flow")?;
    for &leaf in tree.leaves() {
        writeln!(w, "{:.6}", tree.data(leaf).flow)?;
    }
    Ok(())
}

pub fn write_flow_network<W: Write>(w: &mut W, infomap: &Infomap) -> io::Result<()> {
    let tree = infomap.tree();
    for &leaf in tree.leaves() {
        let node = tree.node(leaf);
        writeln!(w, "{} ({})", node.original_index, node.data)?;
        for &e in node.out_edges() {
            let edge = tree.edge(e);
            let target = tree.node(edge.target).original_index;
            writeln!(w, "  --> {} ({:.9})", target, edge.flow)?;
        }
        for &e in node.in_edges() {
            let edge = tree.edge(e);
            let source = tree.node(edge.source).original_index;
            writeln!(w, "  <-- {} ({:.9})", source, edge.flow)?;
        }
    }
    Ok(())
}

fn write_with<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let mut w = create(path)?;
    write(&mut w)
        .and_then(|_| w.flush())
        .map_err(|e| Error::io(path, e))
}

/// Writes every enabled output file and returns their paths. A failed file
/// doesn't stop the others; the first failure is returned at the end.
pub fn write_outputs(
    cfg: &Config,
    infomap: &Infomap,
    start_time: SystemTime,
    elapsed: Duration,
) -> Result<Vec<PathBuf>> {
    if !cfg.any_output_enabled() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(&cfg.out_dir).map_err(|e| Error::io(&cfg.out_dir, e))?;

    let started = format_started_at(start_time);
    let base = output_base_path(cfg);
    let mut written = Vec::new();
    let mut first_error: Option<Error> = None;
    let mut record = |path: PathBuf, result: Result<()>| match result {
        Ok(()) => {
            info!("Wrote {}", path.display());
            written.push(path);
        }
        Err(e) => {
            error!("{}", e);
            first_error.get_or_insert(e);
        }
    };

    if cfg.print_tree {
        let p = with_suffix(&base, "tree");
        let result = write_tree_file(&p, infomap, &started, elapsed).map_err(|e| Error::io(&p, e));
        record(p, result);
    }
    if cfg.print_clu {
        let p = with_suffix(&base, "clu");
        let result = write_with(&p, |w| write_clu(w, infomap));
        record(p, result);
    }
    if cfg.print_rank {
        let p = with_suffix(&base, "rank");
        let result = write_with(&p, |w| write_node_ranks(w, infomap));
        record(p, result);
    }
    if cfg.print_flow {
        let p = with_suffix(&base, "flow");
        let result = write_with(&p, |w| write_flow_network(w, infomap));
        record(p, result);
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Network;

    fn solved_pair() -> Infomap {
        let mut network = Network::from_edges(2, [(0, 1, 1.0)]).unwrap();
        network.set_name(0, "a");
        network.set_name(1, "b");
        let mut infomap = Infomap::new(Config::default(), &network).unwrap();
        infomap.run();
        infomap
    }

    fn render<F>(write: F) -> String
    where
        F: FnOnce(&mut Vec<u8>) -> io::Result<()>,
    {
        let mut buf = Vec::new();
        write(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn tree_lines_name_every_leaf_under_its_module() {
        let infomap = solved_pair();
        let text = render(|w| write_tree_lines(w, &infomap));
        assert_eq!(text, "0:0 a (0)\n0:1 b (1)\n");
    }

    #[test]
    fn clu_is_one_based() {
        let infomap = solved_pair();
        let text = render(|w| write_clu(w, &infomap));
        assert_eq!(text, "*Vertices 2\n0 0 1\n1 1 1\n");
    }

    #[test]
    fn ranks_and_flow_network() {
        let infomap = solved_pair();
        let ranks = render(|w| write_node_ranks(w, &infomap));
        assert_eq!(ranks, "#node-flow\n0.500000\n0.500000\n");

        let flow = render(|w| write_flow_network(w, &infomap));
        let lines: Vec<&str> = flow.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("0 (flow: 0.5"));
        assert_eq!(lines[1], "  --> 1 (0.500000000)");
        assert_eq!(lines[3], "  <-- 0 (0.500000000)");
    }

    #[test]
    fn failed_file_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            out_dir: dir.path().to_path_buf(),
            out_name: "pair".to_string(),
            print_tree: true,
            print_clu: true,
            print_rank: true,
            print_flow: true,
            ..Config::default()
        };
        // A directory where the .clu file should go makes that one fail.
        fs::create_dir(dir.path().join("pair.clu")).unwrap();

        let infomap = solved_pair();
        let result = write_outputs(&cfg, &infomap, SystemTime::now(), Duration::ZERO);
        match result {
            Err(Error::Io { path, .. }) => assert_eq!(path, dir.path().join("pair.clu")),
            other => panic!("expected an I/O error, got {:?}", other),
        }
        for suffix in ["tree", "rank", "flow"] {
            assert!(dir.path().join(format!("pair.{}", suffix)).is_file());
        }
    }

    #[test]
    fn base_path_falls_back_to_network_stem() {
        let cfg = Config {
            network_file: PathBuf::from("data/karate.net"),
            out_dir: PathBuf::from("out"),
            ..Config::default()
        };
        assert_eq!(
            with_suffix(&output_base_path(&cfg), "tree"),
            PathBuf::from("out/karate.tree")
        );
    }
}
