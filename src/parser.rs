use crate::error::{Error, Result};
use log::{debug, warn};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    pub name: Option<String>,
    pub weight: f64,
}

/// Network file contents keyed by the ids used in the file.
#[derive(Debug, Clone, Default)]
pub struct ParsedNetwork {
    pub vertices: FxHashMap<u32, VertexInput>,
    pub links: FxHashMap<(u32, u32), f64>,
    pub skipped_links: usize,
    /// Count given on the `*Vertices` heading, if any.
    pub declared_vertices: Option<usize>,
    /// Links were listed under `*Arcs`.
    pub has_arcs: bool,
}

impl ParsedNetwork {
    fn add_vertex(&mut self, id: u32, vertex: VertexInput) {
        let entry = self.vertices.entry(id).or_default();
        entry.weight = vertex.weight;
        if vertex.name.is_some() {
            entry.name = vertex.name;
        }
    }

    /// Sums repeated links; endpoints of a kept link become vertices.
    fn add_link(&mut self, source: u32, target: u32, weight: f64) {
        if weight <= 0.0 {
            self.skipped_links += 1;
            return;
        }
        *self.links.entry((source, target)).or_insert(0.0) += weight;
        for id in [source, target] {
            self.vertices.entry(id).or_insert_with(|| VertexInput {
                name: None,
                weight: 1.0,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Vertices,
    Links,
    Ignore,
}

enum Line<'a> {
    Skip,
    Heading(Section, Option<usize>),
    Data(&'a str),
}

fn classify(line: &str) -> (Line<'_>, bool) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
        return (Line::Skip, false);
    }
    let Some(heading) = line.strip_prefix('*') else {
        return (Line::Data(line), false);
    };
    let mut words = heading.split_whitespace();
    let keyword = words.next().unwrap_or_default().to_ascii_lowercase();
    let count = words.next().and_then(|w| w.parse::<usize>().ok());
    match keyword.as_str() {
        "vertices" => (Line::Heading(Section::Vertices, count), false),
        "arcs" => (Line::Heading(Section::Links, None), true),
        "edges" | "links" => (Line::Heading(Section::Links, None), false),
        _ => (Line::Heading(Section::Ignore, None), false),
    }
}

fn parse_weight(token: Option<&str>, what: &str) -> std::result::Result<f64, String> {
    match token {
        None => Ok(1.0),
        Some(t) => match t.parse::<f64>() {
            Ok(w) if w.is_finite() => Ok(w),
            _ => Err(format!("bad {} weight '{}'", what, t)),
        },
    }
}

fn parse_id(token: Option<&str>, what: &str) -> std::result::Result<u32, String> {
    let token = token.ok_or_else(|| format!("missing {} id", what))?;
    token
        .parse::<u32>()
        .map_err(|_| format!("bad {} id '{}'", what, token))
}

/// `source target [weight]`
fn parse_link(data: &str) -> std::result::Result<(u32, u32, f64), String> {
    let mut tokens = data.split_whitespace();
    let source = parse_id(tokens.next(), "source")?;
    let target = parse_id(tokens.next(), "target")?;
    let weight = parse_weight(tokens.next(), "link")?;
    Ok((source, target, weight))
}

/// `id ["name with spaces" | name] [weight]`
fn parse_vertex(data: &str) -> std::result::Result<(u32, VertexInput), String> {
    let (id_token, rest) = data
        .split_once(char::is_whitespace)
        .unwrap_or((data, ""));
    let id = parse_id(Some(id_token), "vertex")?;
    let rest = rest.trim_start();

    let (name, tail) = match rest.strip_prefix('"') {
        Some(quoted) => {
            let end = quoted
                .find('"')
                .ok_or_else(|| "unterminated vertex name".to_string())?;
            (Some(quoted[..end].to_string()), &quoted[end + 1..])
        }
        None => {
            let mut tokens = rest.splitn(2, char::is_whitespace);
            let name = tokens.next().filter(|n| !n.is_empty()).map(str::to_string);
            (name, tokens.next().unwrap_or_default())
        }
    };
    let weight = parse_weight(tail.split_whitespace().next(), "vertex")?;
    if weight < 0.0 {
        return Err(format!("negative vertex weight {}", weight));
    }
    Ok((id, VertexInput { name, weight }))
}

/// Reads a Pajek network (`*Vertices`, `*Edges`/`*Arcs`) or a plain link
/// list from `reader`. `path` only labels errors.
///
/// Repeated links are summed; links with non-positive weight are skipped.
pub fn parse_network<R: BufRead>(reader: R, path: &Path) -> Result<ParsedNetwork> {
    let mut parsed = ParsedNetwork::default();
    let mut section = Section::Links;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        let parse_error = |message: String| Error::Parse {
            path: path.to_path_buf(),
            line: line_no + 1,
            message,
        };
        let (kind, arcs) = classify(&line);
        parsed.has_arcs |= arcs;
        match kind {
            Line::Skip => {}
            Line::Heading(next, count) => {
                if next == Section::Vertices {
                    parsed.declared_vertices = count;
                }
                section = next;
            }
            Line::Data(data) => match section {
                Section::Ignore => {}
                Section::Vertices => {
                    let (id, vertex) = parse_vertex(data).map_err(parse_error)?;
                    parsed.add_vertex(id, vertex);
                }
                Section::Links => {
                    let (source, target, weight) = parse_link(data).map_err(parse_error)?;
                    parsed.add_link(source, target, weight);
                }
            },
        }
    }

    if parsed.vertices.is_empty() {
        return Err(Error::EmptyNetwork);
    }
    if let Some(declared) = parsed.declared_vertices {
        if declared != parsed.vertices.len() {
            warn!(
                "'{}' declares {} vertices but uses {}",
                path.display(),
                declared,
                parsed.vertices.len()
            );
        }
    }
    debug!(
        "Parsed '{}': {} vertices, {} links{}",
        path.display(),
        parsed.vertices.len(),
        parsed.links.len(),
        if parsed.has_arcs { " (arcs)" } else { "" }
    );
    Ok(parsed)
}

pub fn parse_network_file(path: &Path) -> Result<ParsedNetwork> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    parse_network(BufReader::new(file), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ParsedNetwork> {
        parse_network(text.as_bytes(), Path::new("mem.net"))
    }

    #[test]
    fn pajek_names_may_contain_spaces() {
        let parsed = parse("*Vertices 3\n1 \"New York\" 2.5\n2 Boston\n3\n*Arcs\n1 2\n2 3 0.5\n").unwrap();
        assert_eq!(parsed.declared_vertices, Some(3));
        assert!(parsed.has_arcs);
        assert_eq!(parsed.vertices[&1].name.as_deref(), Some("New York"));
        assert_eq!(parsed.vertices[&1].weight, 2.5);
        assert_eq!(parsed.vertices[&2].name.as_deref(), Some("Boston"));
        assert_eq!(parsed.vertices[&3].name, None);
        assert_eq!(parsed.links[&(2, 3)], 0.5);
    }

    #[test]
    fn unknown_sections_are_skipped() {
        let parsed = parse("1 2\n*Partitions\nanything here\n*Edges\n2 3\n").unwrap();
        assert_eq!(parsed.links.len(), 2);
        assert!(!parsed.has_arcs);
    }

    #[test]
    fn bad_lines_are_reported() {
        for (text, line) in [
            ("1 2\n1\n", 2),
            ("*Vertices\n1 \"open\n", 2),
            ("*Vertices\n1 a -2\n", 2),
            ("1 2 inf\n", 1),
        ] {
            match parse(text) {
                Err(Error::Parse { line: l, .. }) => assert_eq!(l, line, "{:?}", text),
                other => panic!("{:?}: {:?}", text, other),
            }
        }
    }

    #[test]
    fn comments_only_is_empty() {
        assert!(matches!(parse("# nothing\n% here\n"), Err(Error::EmptyNetwork)));
    }
}
