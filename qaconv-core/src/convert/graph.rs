use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde_json::{Map, Value};

use super::answer::classify_answer;
use super::{DomainConverter, Expansion, choices, field, object, record_id, value_text};
use crate::domain::{AnswerValue, CanonicalQaEntry, DomainFamily, MetaValue, Metadata, RawRecord};
use crate::error::ConversionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Trivial,
    Path,
    Tree,
    Lattice,
    Forest,
    General,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Topology::Trivial => "trivial",
            Topology::Path => "path",
            Topology::Tree => "tree",
            Topology::Lattice => "lattice",
            Topology::Forest => "forest",
            Topology::General => "general",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComplexityTier {
    Low,
    Medium,
    High,
}

impl ComplexityTier {
    pub fn from_score(score: f64) -> Self {
        if score < 4.0 {
            ComplexityTier::Low
        } else if score < 12.0 {
            ComplexityTier::Medium
        } else {
            ComplexityTier::High
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Low => "low",
            ComplexityTier::Medium => "medium",
            ComplexityTier::High => "high",
        }
    }
}

/// Node ids with optional grid coordinates, and adjacency by index.
#[derive(Debug, Clone)]
pub struct Graph {
    pub ids: Vec<String>,
    pub coords: Vec<Option<(f64, f64)>>,
    pub directed: bool,
    pub edges: Vec<(usize, usize)>,
    adj: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
}

impl Graph {
    pub fn from_json(obj: &Map<String, Value>) -> Result<Graph, ConversionError> {
        // nodes/edges may sit under a nested "graph" object
        let src = match obj.get("graph") {
            Some(Value::Object(g)) => g,
            _ => obj,
        };
        let nodes = match field(src, &["nodes", "vertices"]) {
            Some((_, Value::Array(a))) => a,
            Some((name, _)) => return Err(ConversionError::invalid(name, "expected an array")),
            None => return Err(ConversionError::MissingField("nodes".into())),
        };
        let edges = match field(src, &["edges", "links"]) {
            Some((_, Value::Array(a))) => a.as_slice(),
            Some((name, _)) => return Err(ConversionError::invalid(name, "expected an array")),
            None => &[],
        };
        let directed = matches!(src.get("directed"), Some(Value::Bool(true)));

        let mut g = Graph {
            ids: Vec::with_capacity(nodes.len()),
            coords: Vec::with_capacity(nodes.len()),
            directed,
            edges: Vec::with_capacity(edges.len()),
            adj: vec![Vec::new(); nodes.len()],
            index: HashMap::with_capacity(nodes.len()),
        };
        for (i, n) in nodes.iter().enumerate() {
            let (id, xy) = match n {
                Value::Object(o) => {
                    let id = o
                        .get("id")
                        .map(value_text)
                        .ok_or_else(|| ConversionError::GraphIntegrity(format!("node {i} has no id")))?;
                    let xy = match (o.get("x").and_then(Value::as_f64), o.get("y").and_then(Value::as_f64)) {
                        (Some(x), Some(y)) => Some((x, y)),
                        _ => None,
                    };
                    (id, xy)
                }
                other => (value_text(other), None),
            };
            if g.index.insert(id.clone(), i).is_some() {
                return Err(ConversionError::GraphIntegrity(format!("duplicate node id {id}")));
            }
            g.ids.push(id);
            g.coords.push(xy);
        }
        for (i, e) in edges.iter().enumerate() {
            let (a, b) = edge_ends(e).ok_or_else(|| {
                ConversionError::GraphIntegrity(format!("edge {i} is not a pair or source/target object"))
            })?;
            let ai = g.lookup(&a, i)?;
            let bi = g.lookup(&b, i)?;
            g.edges.push((ai, bi));
            g.adj[ai].push(bi);
            if !directed && ai != bi {
                g.adj[bi].push(ai);
            }
        }
        Ok(g)
    }

    fn lookup(&self, id: &str, edge: usize) -> Result<usize, ConversionError> {
        self.index.get(id).copied().ok_or_else(|| {
            ConversionError::GraphIntegrity(format!("edge {edge} references unknown node {id}"))
        })
    }

    pub fn node(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// BFS distances from `from`; `None` for unreachable nodes.
    pub fn distances(&self, from: usize) -> Vec<Option<usize>> {
        let mut dist = vec![None; self.len()];
        let mut q = VecDeque::new();
        dist[from] = Some(0);
        q.push_back(from);
        while let Some(u) = q.pop_front() {
            let d = dist[u].unwrap_or(0);
            for &v in &self.adj[u] {
                if dist[v].is_none() {
                    dist[v] = Some(d + 1);
                    q.push_back(v);
                }
            }
        }
        dist
    }

    /// Weakly connected components.
    pub fn component_count(&self) -> usize {
        let mut undirected = vec![Vec::new(); self.len()];
        for &(a, b) in &self.edges {
            undirected[a].push(b);
            undirected[b].push(a);
        }
        let mut seen = vec![false; self.len()];
        let mut count = 0;
        for s in 0..self.len() {
            if seen[s] {
                continue;
            }
            count += 1;
            let mut stack = vec![s];
            seen[s] = true;
            while let Some(u) = stack.pop() {
                for &v in &undirected[u] {
                    if !seen[v] {
                        seen[v] = true;
                        stack.push(v);
                    }
                }
            }
        }
        count
    }

    fn undirected_edge_set(&self) -> BTreeSet<(usize, usize)> {
        self.edges
            .iter()
            .filter(|(a, b)| a != b)
            .map(|&(a, b)| (a.min(b), a.max(b)))
            .collect()
    }

    pub fn topology(&self) -> Topology {
        let n = self.len();
        if n <= 1 {
            return Topology::Trivial;
        }
        let simple = self.undirected_edge_set();
        let has_loops = self.edges.iter().any(|(a, b)| a == b);
        let m = simple.len();
        let c = self.component_count();
        let acyclic = !has_loops && m + c == n;

        if acyclic && c == 1 {
            let mut degree = vec![0usize; n];
            for &(a, b) in &simple {
                degree[a] += 1;
                degree[b] += 1;
            }
            return if degree.iter().all(|&d| d <= 2) {
                Topology::Path
            } else {
                Topology::Tree
            };
        }
        if self.is_lattice(&simple) {
            return Topology::Lattice;
        }
        if acyclic {
            return Topology::Forest;
        }
        Topology::General
    }

    /// Every node on integer grid coordinates and every edge one unit step.
    fn is_lattice(&self, simple: &BTreeSet<(usize, usize)>) -> bool {
        if simple.is_empty() {
            return false;
        }
        let on_grid = self
            .coords
            .iter()
            .all(|c| matches!(c, Some((x, y)) if x.fract() == 0.0 && y.fract() == 0.0));
        on_grid
            && simple.iter().all(|&(a, b)| match (self.coords[a], self.coords[b]) {
                (Some((ax, ay)), Some((bx, by))) => (ax - bx).abs() + (ay - by).abs() == 1.0,
                _ => false,
            })
    }

    /// Mean out-degree over nodes that have any neighbour.
    pub fn branching_factor(&self) -> f64 {
        let (sum, nodes) = self
            .adj
            .iter()
            .filter(|a| !a.is_empty())
            .fold((0usize, 0usize), |(s, k), a| (s + a.len(), k + 1));
        if nodes == 0 { 0.0 } else { sum as f64 / nodes as f64 }
    }

    /// Longest shortest path from node 0 within its component.
    pub fn eccentricity_from_first(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        self.distances(0).into_iter().flatten().max().unwrap_or(0)
    }
}

fn edge_ends(e: &Value) -> Option<(String, String)> {
    match e {
        Value::Array(pair) if pair.len() >= 2 => Some((value_text(&pair[0]), value_text(&pair[1]))),
        Value::Object(o) => {
            let a = o.get("source").or_else(|| o.get("from"))?;
            let b = o.get("target").or_else(|| o.get("to"))?;
            Some((value_text(a), value_text(b)))
        }
        _ => None,
    }
}

/// What the answer says about a route between the endpoints, if anything.
///
/// Yes/no answers only count for reachability questions, and numbers only
/// for questions about a route's length.
fn route_claim(question: &str, answer: &AnswerValue) -> Option<bool> {
    let q = question.to_ascii_lowercase();
    let about = |words: &[&str]| words.iter().any(|w| q.contains(w));
    match answer {
        AnswerValue::Boolean(b) if about(&["reach", "connected"]) => Some(*b),
        AnswerValue::Integer(i) if about(&["reach", "path", "route", "distance", "steps", "hops", "moves"]) => {
            Some(*i >= 0)
        }
        AnswerValue::Text(s) => {
            let s = s.to_ascii_lowercase();
            let denies = s.contains("unreachable") || s.contains("no path") || s.contains("impossible") || s == "none";
            denies.then_some(false)
        }
        _ => None,
    }
}

/// One graph object to one question about it.
pub struct GraphSpatialConverter;

impl DomainConverter for GraphSpatialConverter {
    fn name(&self) -> &'static str {
        "graph-spatial"
    }

    fn family(&self) -> DomainFamily {
        DomainFamily::GraphSpatial
    }

    fn expansion(&self) -> Expansion {
        Expansion::PerRecord(1)
    }

    fn can_handle(&self, record: &RawRecord) -> bool {
        let Some(obj) = record.as_object() else {
            return false;
        };
        let src = match obj.get("graph") {
            Some(Value::Object(g)) => g,
            _ => obj,
        };
        src.contains_key("nodes") && src.contains_key("edges")
    }

    fn convert(&self, record: &RawRecord) -> Result<Vec<CanonicalQaEntry>, ConversionError> {
        let obj = object(record)?;
        let g = Graph::from_json(obj)?;

        let endpoints = match (field(obj, &["start", "source_node"]), field(obj, &["goal", "target_node"])) {
            (Some((sn, s)), Some((gn, t))) => {
                let s = value_text(s);
                let t = value_text(t);
                let si = g
                    .node(&s)
                    .ok_or_else(|| ConversionError::GraphIntegrity(format!("{sn} {s} is not a node")))?;
                let ti = g
                    .node(&t)
                    .ok_or_else(|| ConversionError::GraphIntegrity(format!("{gn} {t} is not a node")))?;
                Some((s, si, t, ti))
            }
            _ => None,
        };
        let distance = endpoints
            .as_ref()
            .and_then(|&(_, si, _, ti)| g.distances(si)[ti]);

        let (question, answer) = match field(obj, &["question", "prompt"]) {
            Some((_, q)) => {
                let raw = field(obj, &["answer", "solution"])
                    .map(|(_, v)| v)
                    .ok_or_else(|| ConversionError::MissingField("answer".into()))?;
                let answer = match raw {
                    Value::Bool(b) => AnswerValue::Boolean(*b),
                    other => classify_answer(&value_text(other)).to_value(),
                };
                (value_text(q), answer)
            }
            None => match &endpoints {
                Some((s, _, t, _)) => (
                    format!(
                        "In this graph of {} nodes and {} edges, can node {t} be reached from node {s}?",
                        g.len(),
                        g.edges.len()
                    ),
                    AnswerValue::Boolean(distance.is_some()),
                ),
                None => (
                    format!(
                        "How many connected components does this graph of {} nodes and {} edges have?",
                        g.len(),
                        g.edges.len()
                    ),
                    AnswerValue::Integer(g.component_count() as i64),
                ),
            },
        };

        // the posed question must be answerable from the structure given
        if let Some((s, _, t, _)) = &endpoints {
            match (distance, route_claim(&question, &answer)) {
                (None, Some(true)) => {
                    return Err(ConversionError::GraphIntegrity(format!(
                        "{t} is not reachable from {s}, but the answer assumes a route"
                    )));
                }
                (Some(_), Some(false)) => {
                    return Err(ConversionError::GraphIntegrity(format!(
                        "answer says {t} is unreachable from {s}, but a route exists"
                    )));
                }
                _ => {}
            }
        }

        let path_length = distance.unwrap_or_else(|| g.eccentricity_from_first());
        let branching = g.branching_factor();
        let score = path_length as f64 * branching;
        let topology = g.topology();

        let mut meta = Metadata::new();
        if let Some(id) = record_id(obj) {
            meta.insert("scenario_id".into(), MetaValue::Text(id));
        }
        meta.insert("domain".into(), "graph_spatial".into());
        meta.insert("topology".into(), topology.to_string().into());
        meta.insert("node_count".into(), g.len().into());
        meta.insert("edge_count".into(), g.edges.len().into());
        meta.insert("component_count".into(), g.component_count().into());
        meta.insert("path_length".into(), path_length.into());
        meta.insert("branching_factor".into(), ((branching * 100.0).round() / 100.0).into());
        meta.insert("complexity_score".into(), ((score * 100.0).round() / 100.0).into());
        meta.insert(
            "complexity_tier".into(),
            ComplexityTier::from_score(score).as_str().into(),
        );
        if endpoints.is_some() {
            meta.insert("reachable".into(), distance.is_some().into());
        }

        let entry = CanonicalQaEntry::new(question, answer, choices(obj)?, meta)?;
        Ok(vec![entry])
    }
}
