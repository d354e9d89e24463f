use crate::error::{AnalysisError, Result};
use crate::telemetry::{Span, Trace};
use std::collections::HashMap;

/// Validated parent/child view over a trace's spans.
///
/// Nodes are addressed by their index in `trace.spans`. Children are kept in
/// start-time order (ties broken by input position) so that every walk over
/// the forest is deterministic.
#[derive(Debug)]
pub struct SpanForest<'a> {
    trace: &'a Trace,
    children: Vec<Vec<usize>>,
    parents: Vec<Option<usize>>,
    roots: Vec<usize>,
}

/// Root-to-leaf path with the largest cumulative duration
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalPath {
    pub nodes: Vec<usize>,
    pub names: Vec<String>,
    pub total_duration_ms: f64,
}

impl<'a> SpanForest<'a> {
    pub fn build(trace: &'a Trace) -> Result<Self> {
        let malformed = |reason: String| AnalysisError::malformed(&trace.trace_id, reason);

        if trace.spans.is_empty() {
            return Err(malformed("trace has no spans".into()));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(trace.spans.len());
        for (i, span) in trace.spans.iter().enumerate() {
            if span.trace_id != trace.trace_id {
                return Err(malformed(format!(
                    "span {} belongs to trace {}",
                    span.span_id, span.trace_id
                )));
            }
            if span.end_time < span.start_time {
                return Err(malformed(format!("span {} ends before it starts", span.span_id)));
            }
            if index.insert(span.span_id.as_str(), i).is_some() {
                return Err(malformed(format!("duplicate span id {}", span.span_id)));
            }
        }

        let n = trace.spans.len();
        let mut children = vec![Vec::new(); n];
        let mut parents = vec![None; n];
        let mut roots = Vec::new();

        for (i, span) in trace.spans.iter().enumerate() {
            match span.parent_span_id.as_deref() {
                None => roots.push(i),
                Some(parent_id) => {
                    let parent = *index.get(parent_id).ok_or_else(|| {
                        malformed(format!(
                            "span {} references unknown parent {}",
                            span.span_id, parent_id
                        ))
                    })?;
                    children[parent].push(i);
                    parents[i] = Some(parent);
                }
            }
        }

        let by_start = |ids: &mut Vec<usize>| {
            ids.sort_by(|a, b| {
                trace.spans[*a]
                    .start_time
                    .cmp(&trace.spans[*b].start_time)
                    .then(a.cmp(b))
            })
        };
        by_start(&mut roots);
        for list in children.iter_mut() {
            by_start(list);
        }

        // Every span must be reachable from a root, otherwise it sits on a cycle.
        let mut seen = vec![false; n];
        let mut stack: Vec<usize> = roots.clone();
        let mut reached = 0;
        while let Some(node) = stack.pop() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            reached += 1;
            stack.extend(children[node].iter().copied());
        }
        if reached < n {
            let on_cycle = seen
                .iter()
                .position(|visited| !visited)
                .map(|i| trace.spans[i].span_id.clone())
                .unwrap_or_default();
            return Err(malformed(format!(
                "cyclic parent links involving span {}",
                on_cycle
            )));
        }

        Ok(Self {
            trace,
            children,
            parents,
            roots,
        })
    }

    pub fn trace(&self) -> &'a Trace {
        self.trace
    }

    pub fn len(&self) -> usize {
        self.trace.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.spans.is_empty()
    }

    pub fn span(&self, node: usize) -> &'a Span {
        &self.trace.spans[node]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    pub fn duration_ms(&self, node: usize) -> f64 {
        self.span(node).duration_ms()
    }

    /// duration - sum(children durations); negative when children overlap.
    pub fn self_time_ms(&self, node: usize) -> f64 {
        let children: f64 = self.children[node]
            .iter()
            .map(|child| self.duration_ms(*child))
            .sum();
        self.duration_ms(node) - children
    }

    /// Pre-order walk (parents before children) over every root.
    pub fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.len());
        let mut stack: Vec<usize> = self.roots.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children[node].iter().rev().copied());
        }
        order
    }

    /// Nodes of the subtree rooted at `node`, including `node`.
    pub fn subtree(&self, node: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children[current].iter().rev().copied());
        }
        out
    }

    pub fn critical_path(&self) -> CriticalPath {
        let n = self.len();
        let mut best = vec![0.0_f64; n];
        let mut next: Vec<Option<usize>> = vec![None; n];

        // Children are finished before their parent when walking pre-order backwards.
        for &node in self.preorder().iter().rev() {
            let mut chosen: Option<(usize, f64)> = None;
            for &child in &self.children[node] {
                match chosen {
                    Some((_, value)) if best[child] <= value => {}
                    _ => chosen = Some((child, best[child])),
                }
            }
            best[node] = self.duration_ms(node) + chosen.map_or(0.0, |(_, v)| v);
            next[node] = chosen.map(|(child, _)| child);
        }

        let start = self
            .roots
            .iter()
            .copied()
            .fold(None::<usize>, |acc, root| match acc {
                Some(current) if best[root] <= best[current] => Some(current),
                _ => Some(root),
            });

        let mut nodes = Vec::new();
        let mut cursor = start;
        while let Some(node) = cursor {
            nodes.push(node);
            cursor = next[node];
        }

        let names = nodes.iter().map(|n| self.span(*n).name.clone()).collect();
        CriticalPath {
            total_duration_ms: start.map_or(0.0, |root| best[root]),
            nodes,
            names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SpanStatus;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn span(id: &str, parent: Option<&str>, name: &str, start_ms: i64, end_ms: i64) -> Span {
        Span {
            span_id: id.into(),
            trace_id: "t".into(),
            parent_span_id: parent.map(str::to_string),
            name: name.into(),
            start_time: base() + Duration::milliseconds(start_ms),
            end_time: base() + Duration::milliseconds(end_ms),
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn self_time_subtracts_children() {
        let trace = Trace::new(
            "t",
            vec![
                span("a", None, "A", 0, 100),
                span("b", Some("a"), "B", 10, 40),
                span("c", Some("a"), "C", 50, 70),
            ],
        );
        let forest = SpanForest::build(&trace).unwrap();
        assert!((forest.self_time_ms(0) - 50.0).abs() < 1e-9);
        assert_eq!(forest.children(0), &[1, 2]);
    }

    #[test]
    fn rejects_dangling_parent() {
        let trace = Trace::new("t", vec![span("a", Some("missing"), "A", 0, 1)]);
        let err = SpanForest::build(&trace).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedTrace { .. }));
        assert!(err.to_string().contains("unknown parent missing"));
    }

    #[test]
    fn rejects_cycles() {
        let trace = Trace::new(
            "t",
            vec![
                span("root", None, "R", 0, 10),
                span("a", Some("b"), "A", 0, 1),
                span("b", Some("a"), "B", 0, 1),
            ],
        );
        let err = SpanForest::build(&trace).unwrap_err();
        assert!(err.to_string().contains("cyclic"));
    }

    #[test]
    fn rejects_self_parent_and_duplicates() {
        let looped = Trace::new("t", vec![span("a", Some("a"), "A", 0, 1)]);
        assert!(SpanForest::build(&looped).is_err());

        let duplicated = Trace::new(
            "t",
            vec![span("a", None, "A", 0, 1), span("a", None, "A", 0, 1)],
        );
        assert!(SpanForest::build(&duplicated).is_err());
    }

    #[test]
    fn critical_path_prefers_longer_branch() {
        let trace = Trace::new(
            "t",
            vec![
                span("root", None, "root", 0, 100),
                span("fast", Some("root"), "fast", 1, 6),
                span("slow", Some("root"), "slow", 2, 22),
                span("leaf", Some("slow"), "leaf", 3, 8),
            ],
        );
        let forest = SpanForest::build(&trace).unwrap();
        let path = forest.critical_path();
        assert_eq!(path.names, vec!["root", "slow", "leaf"]);
        assert!((path.total_duration_ms - 125.0).abs() < 1e-9);
    }

    #[test]
    fn preorder_visits_parents_first() {
        let trace = Trace::new(
            "t",
            vec![
                span("c", Some("b"), "C", 2, 3),
                span("b", Some("a"), "B", 1, 4),
                span("a", None, "A", 0, 5),
            ],
        );
        let forest = SpanForest::build(&trace).unwrap();
        let names: Vec<&str> = forest
            .preorder()
            .into_iter()
            .map(|n| forest.span(n).name.as_str())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }
}
