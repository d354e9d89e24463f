use crate::config::CausalConfig;
use crate::forest::SpanForest;
use crate::telemetry::Trace;
use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Weights on a service(parent) -> service(child) edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalEdge {
    /// Parent/child span pairs observed across all traces
    pub co_occurrence: u64,
    /// Traces in which both parent and child span were ERROR
    pub error_weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub from: String,
    pub to: String,
    pub co_occurrence: u64,
    pub error_weight: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        })
    }
}

/// How the primary cause was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisBasis {
    /// Node originating the most ERROR->ERROR edges
    ErrorWeight,
    /// No error edges; upstream source reaching the deepest failing service
    Reachability,
    /// No failing spans at all
    NoErrors,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub service: String,
    pub outbound_error_weight: u64,
    pub inbound_error_weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenEdge {
    pub from: String,
    pub to: String,
    pub co_occurrence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseHypothesis {
    pub primary_cause: Option<String>,
    pub confidence: Confidence,
    pub propagation_depth: usize,
    pub affected_services: BTreeSet<String>,
    pub basis: HypothesisBasis,
    pub candidates: Vec<CandidateScore>,
    pub broken_edges: Vec<BrokenEdge>,
}

impl RootCauseHypothesis {
    fn none(basis: HypothesisBasis) -> Self {
        Self {
            primary_cause: None,
            confidence: Confidence::Low,
            propagation_depth: 0,
            affected_services: BTreeSet::new(),
            basis,
            candidates: Vec::new(),
            broken_edges: Vec::new(),
        }
    }
}

/// Service dependency graph aggregated from a set of traces.
///
/// Built fresh for each investigation and never persisted.
#[derive(Debug, Clone, Default)]
pub struct CausalGraph {
    graph: DiGraph<String, CausalEdge>,
    nodes: HashMap<String, NodeIndex>,
    error_spans: BTreeMap<String, u64>,
    traces: usize,
    skipped: Vec<String>,
}

impl CausalGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<CausalEdge> {
        let (a, b) = (self.nodes.get(from)?, self.nodes.get(to)?);
        self.graph
            .find_edge(*a, *b)
            .and_then(|e| self.graph.edge_weight(e))
            .copied()
    }

    /// Every edge, ordered by (from, to).
    pub fn edges(&self) -> Vec<EdgeSummary> {
        let mut edges: Vec<EdgeSummary> = self
            .graph
            .edge_references()
            .map(|e| EdgeSummary {
                from: self.graph[e.source()].clone(),
                to: self.graph[e.target()].clone(),
                co_occurrence: e.weight().co_occurrence,
                error_weight: e.weight().error_weight,
            })
            .collect();
        edges.sort_by(|a, b| a.from.cmp(&b.from).then(a.to.cmp(&b.to)));
        edges
    }

    /// Services owning at least one ERROR span
    pub fn error_services(&self) -> Vec<String> {
        self.error_spans.keys().cloned().collect()
    }

    pub fn traces_analyzed(&self) -> usize {
        self.traces
    }

    /// Trace ids left out because their span forest was malformed
    pub fn skipped_traces(&self) -> &[String] {
        &self.skipped
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    fn node(&mut self, service: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(service) {
            return *idx;
        }
        let idx = self.graph.add_node(service.to_string());
        self.nodes.insert(service.to_string(), idx);
        idx
    }

    fn add_trace(&mut self, forest: &SpanForest<'_>) {
        let mut errored_edges: HashSet<EdgeIndex> = HashSet::new();
        for node in forest.preorder() {
            let span = forest.span(node);
            let child = self.node(span.service());
            if span.is_error() {
                *self.error_spans.entry(span.service().to_string()).or_insert(0) += 1;
            }

            let Some(parent) = forest.parent(node).map(|p| forest.span(p)) else {
                continue;
            };
            if parent.service() == span.service() {
                continue;
            }
            let from = self.node(parent.service());
            let edge = match self.graph.find_edge(from, child) {
                Some(edge) => edge,
                None => self.graph.add_edge(from, child, CausalEdge::default()),
            };
            if let Some(weight) = self.graph.edge_weight_mut(edge) {
                weight.co_occurrence += 1;
                if parent.is_error() && span.is_error() && errored_edges.insert(edge) {
                    weight.error_weight += 1;
                }
            }
        }
        self.traces += 1;
    }

    fn error_flow(&self, idx: NodeIndex, direction: Direction) -> u64 {
        self.graph
            .edges_directed(idx, direction)
            .map(|e| e.weight().error_weight)
            .sum()
    }

    fn is_error_bearing(&self, idx: NodeIndex) -> bool {
        self.error_spans.contains_key(&self.graph[idx])
    }
}

/// Copy of the graph with cycles removed, plus the edges dropped to get there.
fn acyclic(graph: &DiGraph<String, CausalEdge>) -> (DiGraph<String, CausalEdge>, Vec<BrokenEdge>) {
    let mut dag = graph.clone();
    let mut broken = Vec::new();

    while is_cyclic_directed(&dag) {
        let mut removed_any = false;
        for component in tarjan_scc(&dag) {
            if component.len() < 2 {
                continue;
            }
            let members: HashSet<NodeIndex> = component.iter().copied().collect();
            let weakest = dag
                .edge_references()
                .filter(|e| members.contains(&e.source()) && members.contains(&e.target()))
                .min_by(|a, b| {
                    a.weight()
                        .co_occurrence
                        .cmp(&b.weight().co_occurrence)
                        .then(a.weight().error_weight.cmp(&b.weight().error_weight))
                        .then_with(|| dag[a.source()].cmp(&dag[b.source()]))
                        .then_with(|| dag[a.target()].cmp(&dag[b.target()]))
                })
                .map(|e| (e.id(), e.source(), e.target(), e.weight().co_occurrence));

            if let Some((edge, from, to, co_occurrence)) = weakest {
                broken.push(BrokenEdge {
                    from: dag[from].clone(),
                    to: dag[to].clone(),
                    co_occurrence,
                });
                dag.remove_edge(edge);
                removed_any = true;
                // Edge indices shift after removal; recompute components.
                break;
            }
        }
        if !removed_any {
            break;
        }
    }
    (dag, broken)
}

/// Longest edge count from `root` to any node satisfying `target`, in a DAG.
fn longest_path_to(
    dag: &DiGraph<String, CausalEdge>,
    root: NodeIndex,
    target: impl Fn(NodeIndex) -> bool,
) -> usize {
    let Ok(order) = toposort(dag, None) else {
        return 0;
    };
    let mut distance: HashMap<NodeIndex, usize> = HashMap::from([(root, 0)]);
    for node in order {
        let Some(&d) = distance.get(&node) else {
            continue;
        };
        for next in dag.neighbors_directed(node, Direction::Outgoing) {
            let entry = distance.entry(next).or_insert(0);
            *entry = (*entry).max(d + 1);
        }
    }
    distance
        .into_iter()
        .filter(|(node, _)| target(*node))
        .map(|(_, d)| d)
        .max()
        .unwrap_or(0)
}

fn reachable(graph: &DiGraph<String, CausalEdge>, root: NodeIndex) -> BTreeSet<String> {
    let mut bfs = Bfs::new(graph, root);
    let mut out = BTreeSet::new();
    while let Some(node) = bfs.next(graph) {
        out.insert(graph[node].clone());
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct CausalGraphBuilder {
    config: CausalConfig,
}

impl CausalGraphBuilder {
    pub fn new(config: CausalConfig) -> Self {
        Self { config }
    }

    /// Aggregate traces into a service graph; malformed traces are skipped and counted.
    pub fn build(&self, traces: &[Trace]) -> CausalGraph {
        let mut graph = CausalGraph::default();
        for trace in traces {
            match SpanForest::build(trace) {
                Ok(forest) => graph.add_trace(&forest),
                Err(e) => {
                    tracing::warn!(
                        trace_id = %trace.trace_id,
                        error = %e,
                        "skipping trace in causal graph"
                    );
                    graph.skipped.push(trace.trace_id.clone());
                }
            }
        }
        tracing::debug!(
            services = graph.node_count(),
            edges = graph.edge_count(),
            skipped = graph.skipped.len(),
            "causal graph built"
        );
        graph
    }

    pub fn hypothesize(&self, graph: &CausalGraph) -> RootCauseHypothesis {
        if graph.error_spans.is_empty() {
            return RootCauseHypothesis::none(HypothesisBasis::NoErrors);
        }

        let (dag, broken_edges) = acyclic(&graph.graph);
        let error_bearing = |idx: NodeIndex| graph.is_error_bearing(idx);

        let mut candidates: Vec<(NodeIndex, CandidateScore)> = graph
            .graph
            .node_indices()
            .map(|idx| {
                let score = CandidateScore {
                    service: graph.graph[idx].clone(),
                    outbound_error_weight: graph.error_flow(idx, Direction::Outgoing),
                    inbound_error_weight: graph.error_flow(idx, Direction::Incoming),
                };
                (idx, score)
            })
            .filter(|(_, s)| {
                s.outbound_error_weight > 0
                    && s.inbound_error_weight as f64
                        <= self.config.inbound_ratio * s.outbound_error_weight as f64
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.1.outbound_error_weight
                .cmp(&a.1.outbound_error_weight)
                .then(a.1.service.cmp(&b.1.service))
        });

        let (root, basis, confidence) = match candidates.first() {
            Some((idx, top)) => {
                let leader = top.outbound_error_weight as f64;
                let runner_up = candidates
                    .get(1)
                    .map_or(0.0, |(_, s)| s.outbound_error_weight as f64);
                let dominant = leader > self.config.dominance_ratio * runner_up;
                let confidence = if runner_up == 0.0 || dominant {
                    Confidence::High
                } else if leader > runner_up {
                    Confidence::Medium
                } else {
                    Confidence::Low
                };
                (*idx, HypothesisBasis::ErrorWeight, confidence)
            }
            None => match self.deepest_source(graph, &dag) {
                Some(idx) => (idx, HypothesisBasis::Reachability, Confidence::Low),
                None => return RootCauseHypothesis::none(HypothesisBasis::NoErrors),
            },
        };

        let hypothesis = RootCauseHypothesis {
            primary_cause: Some(graph.graph[root].clone()),
            confidence,
            propagation_depth: longest_path_to(&dag, root, error_bearing),
            affected_services: reachable(&graph.graph, root),
            basis,
            candidates: candidates.into_iter().map(|(_, s)| s).collect(),
            broken_edges,
        };
        tracing::info!(
            primary_cause = ?hypothesis.primary_cause,
            confidence = %hypothesis.confidence,
            depth = hypothesis.propagation_depth,
            "root cause hypothesis"
        );
        hypothesis
    }

    /// Upstream-most node whose descendants include the farthest failing service.
    fn deepest_source(
        &self,
        graph: &CausalGraph,
        dag: &DiGraph<String, CausalEdge>,
    ) -> Option<NodeIndex> {
        let error_bearing = |idx: NodeIndex| graph.is_error_bearing(idx);
        let reaches_error = |idx: NodeIndex| {
            let mut bfs = Bfs::new(dag, idx);
            std::iter::from_fn(|| bfs.next(dag)).any(error_bearing)
        };

        let sources: Vec<NodeIndex> = dag
            .node_indices()
            .filter(|idx| dag.neighbors_directed(*idx, Direction::Incoming).next().is_none())
            .filter(|idx| reaches_error(*idx))
            .collect();
        let pool = if sources.is_empty() {
            dag.node_indices().filter(|idx| reaches_error(*idx)).collect()
        } else {
            sources
        };

        pool.into_iter()
            .map(|idx| (idx, longest_path_to(dag, idx, error_bearing)))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| dag[b.0].cmp(&dag[a.0])))
            .map(|(idx, _)| idx)
    }
}
