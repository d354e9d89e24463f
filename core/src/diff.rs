use crate::config::TraceDiffConfig;
use crate::error::Result;
use crate::findings::{strongest, EvidenceRef, Finding, FindingKind};
use crate::forest::SpanForest;
use crate::telemetry::{Span, Trace};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Improved,
    Regressed,
    Unchanged,
}

impl fmt::Display for Assessment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Assessment::Improved => "improved",
            Assessment::Regressed => "regressed",
            Assessment::Unchanged => "unchanged",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRef {
    pub span_id: String,
    pub name: String,
    pub service: String,
}

impl From<&Span> for SpanRef {
    fn from(span: &Span) -> Self {
        Self {
            span_id: span.span_id.clone(),
            name: span.name.clone(),
            service: span.service().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedSpan {
    pub baseline: SpanRef,
    pub target: SpanRef,
    pub baseline_self_ms: f64,
    pub target_self_ms: f64,
    pub self_time_delta_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceComparisonReport {
    pub baseline_trace_id: String,
    pub target_trace_id: String,
    pub baseline_duration_ms: f64,
    pub target_duration_ms: f64,
    pub matched: Vec<MatchedSpan>,
    pub added: Vec<SpanRef>,
    pub removed: Vec<SpanRef>,
    pub baseline_critical_path: Vec<String>,
    pub target_critical_path: Vec<String>,
    pub findings: Vec<Finding>,
    pub regression_score: f64,
    pub improvement_score: f64,
    pub overall_assessment: Assessment,
    pub root_cause_hypothesis: String,
}

impl TraceComparisonReport {
    pub fn findings_of(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }
}

/// Node pairing produced by the top-down alignment pass
struct Alignment {
    pairs: Vec<(usize, usize)>,
    added_roots: Vec<usize>,
    removed_roots: Vec<usize>,
}

/// Aligns two call trees and reports what changed between them.
#[derive(Debug, Clone, Default)]
pub struct TraceDiffer {
    config: TraceDiffConfig,
}

impl TraceDiffer {
    pub fn new(config: TraceDiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TraceDiffConfig {
        &self.config
    }

    pub fn diff(&self, baseline: &Trace, target: &Trace) -> Result<TraceComparisonReport> {
        let base = SpanForest::build(baseline)?;
        let tgt = SpanForest::build(target)?;

        let alignment = align(&base, &tgt);
        let mut findings = Vec::new();
        let mut improvement = 0.0;

        // Errors first: a new failure outranks any latency movement in the summary.
        for &(b, t) in &alignment.pairs {
            let (bs, ts) = (base.span(b), tgt.span(t));
            if !bs.is_error() && ts.is_error() {
                findings.push(Finding::new(
                    FindingKind::NewError,
                    EvidenceRef::span(ts),
                    1.0,
                    1.0,
                    format!("'{}' now fails (was OK in baseline)", ts.name),
                ));
            } else if bs.is_error() && !ts.is_error() {
                improvement += self.config.error_weight;
            }
        }

        let added: Vec<usize> = alignment
            .added_roots
            .iter()
            .flat_map(|root| tgt.subtree(*root))
            .collect();
        for &node in &added {
            let span = tgt.span(node);
            if span.is_error() {
                findings.push(Finding::new(
                    FindingKind::NewError,
                    EvidenceRef::span(span),
                    1.0,
                    1.0,
                    format!("new span '{}' fails", span.name),
                ));
            }
        }

        let mut matched = Vec::with_capacity(alignment.pairs.len());
        let mut regressions = Vec::new();
        for &(b, t) in &alignment.pairs {
            let baseline_self = base.self_time_ms(b);
            let target_self = tgt.self_time_ms(t);
            let delta = target_self - baseline_self;
            matched.push(MatchedSpan {
                baseline: base.span(b).into(),
                target: tgt.span(t).into(),
                baseline_self_ms: baseline_self,
                target_self_ms: target_self,
                self_time_delta_ms: delta,
            });
            if delta > self.config.min_delta_ms {
                regressions.push((t, baseline_self, delta));
            } else if delta < -self.config.min_delta_ms {
                improvement += -delta * self.config.latency_weight;
            }
        }

        regressions.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        for (t, baseline_self, delta) in regressions.into_iter().take(self.config.top_k) {
            let span = tgt.span(t);
            let confidence = if baseline_self <= 0.0 {
                1.0
            } else {
                (delta / baseline_self).min(1.0)
            };
            findings.push(Finding::new(
                FindingKind::LatencyRegression,
                EvidenceRef::span(span),
                delta,
                confidence,
                format!(
                    "latency regression in '{}' (+{:.1}ms self time)",
                    span.name, delta
                ),
            ));
        }

        findings.extend(self.new_fanouts(&base, &tgt, &alignment));

        for &root in &alignment.added_roots {
            let span = tgt.span(root);
            let size = tgt.subtree(root).len();
            findings.push(Finding::new(
                FindingKind::StructuralChange,
                EvidenceRef::span(span),
                size as f64,
                1.0,
                format!("{} span(s) added under '{}'", size, span.name),
            ));
        }
        for &root in &alignment.removed_roots {
            let span = base.span(root);
            let size = base.subtree(root).len();
            findings.push(Finding::new(
                FindingKind::StructuralChange,
                EvidenceRef::span(span),
                size as f64,
                1.0,
                format!("{} span(s) removed under '{}'", size, span.name),
            ));
        }

        let base_path = base.critical_path();
        let tgt_path = tgt.critical_path();
        if base_path.names != tgt_path.names {
            let common = base_path
                .names
                .iter()
                .zip(&tgt_path.names)
                .take_while(|(a, b)| a == b)
                .count();
            let diverging = base_path.names.len().max(tgt_path.names.len()) - common;
            let anchor = tgt_path
                .nodes
                .get(common)
                .or_else(|| tgt_path.nodes.last())
                .map(|n| tgt.span(*n));
            if let Some(anchor) = anchor {
                findings.push(Finding::new(
                    FindingKind::StructuralChange,
                    EvidenceRef::span(anchor),
                    diverging as f64,
                    0.5,
                    format!(
                        "critical path changed: {} -> {}",
                        base_path.names.join(" > "),
                        tgt_path.names.join(" > ")
                    ),
                ));
            }
        }

        let regression: f64 = findings.iter().map(|f| self.weight(f)).sum();
        let net = regression - improvement;
        let overall_assessment = if net > self.config.assessment_threshold {
            Assessment::Regressed
        } else if net < -self.config.assessment_threshold {
            Assessment::Improved
        } else {
            Assessment::Unchanged
        };

        let root_cause_hypothesis = strongest(&findings)
            .map(|f| f.description.clone())
            .unwrap_or_else(|| "No significant differences detected".to_string());

        tracing::debug!(
            baseline = %baseline.trace_id,
            target = %target.trace_id,
            findings = findings.len(),
            assessment = %overall_assessment,
            "trace diff complete"
        );

        Ok(TraceComparisonReport {
            baseline_trace_id: baseline.trace_id.clone(),
            target_trace_id: target.trace_id.clone(),
            baseline_duration_ms: baseline.duration_ms(),
            target_duration_ms: target.duration_ms(),
            matched,
            added: added.iter().map(|n| tgt.span(*n).into()).collect(),
            removed: alignment
                .removed_roots
                .iter()
                .flat_map(|root| base.subtree(*root))
                .map(|n| base.span(n).into())
                .collect(),
            baseline_critical_path: base_path.names,
            target_critical_path: tgt_path.names,
            findings,
            regression_score: regression,
            improvement_score: improvement,
            overall_assessment,
            root_cause_hypothesis,
        })
    }

    fn weight(&self, finding: &Finding) -> f64 {
        let per_unit = match finding.kind {
            FindingKind::LatencyRegression => self.config.latency_weight,
            FindingKind::NewError => self.config.error_weight,
            FindingKind::StructuralChange => self.config.structural_weight,
            FindingKind::FanoutPattern => self.config.fanout_weight,
            FindingKind::LogAnomaly | FindingKind::MetricAnomaly => 0.0,
        };
        per_unit * finding.magnitude
    }

    /// Fan-out groups present in the target but not at the aligned baseline parent.
    fn new_fanouts(
        &self,
        base: &SpanForest<'_>,
        tgt: &SpanForest<'_>,
        alignment: &Alignment,
    ) -> Vec<Finding> {
        let threshold = self.config.fanout_threshold;
        let baseline_groups: HashSet<(usize, String)> = base
            .preorder()
            .into_iter()
            .flat_map(|node| {
                sequential_fanouts(base, node, threshold)
                    .into_iter()
                    .map(move |(name, _)| (node, name))
            })
            .collect();
        let to_baseline: HashMap<usize, usize> =
            alignment.pairs.iter().map(|&(b, t)| (t, b)).collect();

        let mut findings = Vec::new();
        for node in tgt.preorder() {
            for (name, children) in sequential_fanouts(tgt, node, threshold) {
                let known = to_baseline
                    .get(&node)
                    .is_some_and(|b| baseline_groups.contains(&(*b, name.clone())));
                if known {
                    continue;
                }
                let parent = tgt.span(node);
                let busy: f64 = children.iter().map(|c| tgt.duration_ms(*c)).sum();
                let parent_ms = tgt.duration_ms(node);
                let confidence = if parent_ms <= 0.0 {
                    1.0
                } else {
                    busy / parent_ms
                };
                findings.push(Finding::new(
                    FindingKind::FanoutPattern,
                    EvidenceRef::span(parent),
                    children.len() as f64,
                    confidence,
                    format!(
                        "'{}' calls '{}' {} times sequentially",
                        parent.name,
                        name,
                        children.len()
                    ),
                ));
            }
        }
        findings
    }
}

/// Same-name children of `node` that number at least `threshold` and never overlap.
fn sequential_fanouts(
    forest: &SpanForest<'_>,
    node: usize,
    threshold: usize,
) -> Vec<(String, Vec<usize>)> {
    let children = forest.children(node);
    if children.len() < threshold {
        return Vec::new();
    }
    // children are already in start order, so the groups are too
    children
        .iter()
        .copied()
        .into_group_map_by(|c| forest.span(*c).name.clone())
        .into_iter()
        .filter(|(_, group)| group.len() >= threshold)
        .filter(|(_, group)| {
            group
                .windows(2)
                .all(|pair| forest.span(pair[0]).end_time <= forest.span(pair[1]).start_time)
        })
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .collect()
}

/// Top-down, level-by-level alignment of two forests.
fn align(base: &SpanForest<'_>, tgt: &SpanForest<'_>) -> Alignment {
    let mut alignment = Alignment {
        pairs: Vec::new(),
        added_roots: Vec::new(),
        removed_roots: Vec::new(),
    };
    let mut queue = VecDeque::new();
    queue.push_back((base.roots().to_vec(), tgt.roots().to_vec()));

    while let Some((base_level, tgt_level)) = queue.pop_front() {
        let mut used = vec![false; base_level.len()];
        let mut assigned: Vec<Option<usize>> = vec![None; tgt_level.len()];

        // Pass 1: same name and one attribute set contained in the other.
        for (ti, &t) in tgt_level.iter().enumerate() {
            let ts = tgt.span(t);
            let found = base_level.iter().enumerate().position(|(bi, &b)| {
                let bs = base.span(b);
                !used[bi]
                    && bs.name == ts.name
                    && (ts.attributes_subset_of(bs) || bs.attributes_subset_of(ts))
            });
            if let Some(bi) = found {
                used[bi] = true;
                assigned[ti] = Some(bi);
            }
        }

        // Pass 2: remaining nodes of the same name, positionally by start time.
        for (ti, &t) in tgt_level.iter().enumerate() {
            if assigned[ti].is_some() {
                continue;
            }
            let name = &tgt.span(t).name;
            let found = base_level
                .iter()
                .enumerate()
                .position(|(bi, &b)| !used[bi] && &base.span(b).name == name);
            if let Some(bi) = found {
                used[bi] = true;
                assigned[ti] = Some(bi);
            }
        }

        for (ti, &t) in tgt_level.iter().enumerate() {
            match assigned[ti] {
                Some(bi) => {
                    let b = base_level[bi];
                    alignment.pairs.push((b, t));
                    queue.push_back((base.children(b).to_vec(), tgt.children(t).to_vec()));
                }
                None => alignment.added_roots.push(t),
            }
        }
        for (bi, &b) in base_level.iter().enumerate() {
            if !used[bi] {
                alignment.removed_roots.push(b);
            }
        }
    }

    alignment
}
