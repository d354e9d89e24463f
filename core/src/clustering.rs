//! Online log template extraction.
//!
//! Lines are tokenized, bucketed by token count and a short prefix, and merged
//! into the most similar template in their bucket. Positions that disagree turn
//! into wildcards and never turn back. The store is capacity bounded and evicts
//! the least-recently-updated template first.
//!
//! Clustering depends on input order: the same lines fed in a different order
//! can produce different templates. `LogClusteringConfig::canonicalize` sorts a
//! batch by timestamp first when a caller needs order-independent batches.

use crate::config::LogClusteringConfig;
use crate::telemetry::{LogEntry, Severity};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

pub type ClusterId = u64;

pub const WILDCARD: &str = "<*>";

const DELIMITERS: &[char] = &[',', ';', ':', '=', '(', ')', '[', ']', '{', '}', '"', '\'', '|'];

/// Token sequence with wildcard positions; serialized as a single string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Template(Vec<String>);

impl Template {
    pub fn new(tokens: Vec<String>) -> Self {
        Self(tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn wildcards(&self) -> usize {
        self.0.iter().filter(|t| t.as_str() == WILDCARD).count()
    }

    /// Share of positions where the template accepts `tokens`.
    fn similarity(&self, tokens: &[String]) -> f64 {
        if self.0.is_empty() {
            return 1.0;
        }
        let agreeing = self
            .0
            .iter()
            .zip(tokens)
            .filter(|(t, token)| t.as_str() == WILDCARD || t == token)
            .count();
        agreeing as f64 / self.0.len() as f64
    }

    fn absorb(&mut self, tokens: &[String]) {
        for (slot, token) in self.0.iter_mut().zip(tokens) {
            if slot != token {
                *slot = WILDCARD.to_string();
            }
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Template(raw.split_whitespace().map(str::to_string).collect()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogExemplar {
    pub trace_id: String,
    #[serde(default)]
    pub span_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogCluster {
    pub id: ClusterId,
    pub template: Template,
    pub count: u64,
    #[serde(default)]
    pub severity_counts: BTreeMap<Severity, u64>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub exemplars: Vec<LogExemplar>,
    /// Every trace id carried by a member line; unlike `exemplars`, not capped
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub trace_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub span_ids: BTreeSet<String>,
    /// Created after the clusterer was seeded from a persisted snapshot
    #[serde(default)]
    pub novel: bool,
    #[serde(skip)]
    last_seq: u64,
}

impl LogCluster {
    pub fn error_count(&self) -> u64 {
        self.severity_counts
            .iter()
            .filter(|(severity, _)| severity.is_error())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn error_share(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count() as f64 / self.count as f64
        }
    }

    /// First-to-last activity range intersects `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.first_seen <= end && start <= self.last_updated
    }

    pub fn mentions_trace(&self, trace_id: &str) -> bool {
        self.trace_ids.contains(trace_id)
    }

    pub fn mentions_span(&self, span_id: &str) -> bool {
        self.span_ids.contains(span_id)
    }

    /// Some member line carried a trace or span id.
    pub fn has_id_links(&self) -> bool {
        !self.trace_ids.is_empty() || !self.span_ids.is_empty()
    }
}

type IndexKey = (usize, Vec<String>);

#[derive(Debug)]
pub struct LogPatternClusterer {
    config: LogClusteringConfig,
    clusters: LruCache<ClusterId, LogCluster>,
    index: HashMap<IndexKey, Vec<ClusterId>>,
    next_id: ClusterId,
    seq: u64,
    seeded_below: Option<ClusterId>,
    evicted: u64,
}

impl LogPatternClusterer {
    pub fn new(config: LogClusteringConfig) -> Self {
        Self {
            config,
            clusters: LruCache::unbounded(),
            index: HashMap::new(),
            next_id: 0,
            seq: 0,
            seeded_below: None,
            evicted: 0,
        }
    }

    /// Continue clustering from a persisted snapshot. Clusters created from
    /// here on are reported as novel.
    pub fn from_snapshot(config: LogClusteringConfig, mut snapshot: Vec<LogCluster>) -> Self {
        let mut clusterer = Self::new(config);
        snapshot.sort_by(|a, b| a.last_updated.cmp(&b.last_updated).then(a.id.cmp(&b.id)));
        let keep_from = snapshot.len().saturating_sub(clusterer.config.max_clusters);

        for mut cluster in snapshot.into_iter().skip(keep_from) {
            clusterer.seq += 1;
            cluster.last_seq = clusterer.seq;
            cluster.novel = false;
            for exemplar in &cluster.exemplars {
                cluster.trace_ids.insert(exemplar.trace_id.clone());
                cluster.span_ids.extend(exemplar.span_id.clone());
            }
            clusterer.next_id = clusterer.next_id.max(cluster.id + 1);
            let key = index_key(cluster.template.tokens(), clusterer.config.prefix_depth);
            clusterer.index.entry(key).or_default().push(cluster.id);
            clusterer.clusters.put(cluster.id, cluster);
        }
        clusterer.seeded_below = Some(clusterer.next_id);
        clusterer
    }

    pub fn config(&self) -> &LogClusteringConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn ingest(&mut self, entry: &LogEntry) -> ClusterId {
        let tokens = tokenize(&entry.message);
        let key = index_key(&tokens, self.config.prefix_depth);
        self.seq += 1;

        match self.best_match(&key, &tokens) {
            Some(id) => {
                let seq = self.seq;
                let max_exemplars = self.config.max_exemplars;
                if let Some(cluster) = self.clusters.get_mut(&id) {
                    cluster.template.absorb(&tokens);
                    cluster.count += 1;
                    *cluster.severity_counts.entry(entry.severity).or_insert(0) += 1;
                    cluster.first_seen = cluster.first_seen.min(entry.timestamp);
                    cluster.last_updated = cluster.last_updated.max(entry.timestamp);
                    cluster.last_seq = seq;
                    remember(cluster, entry, max_exemplars);
                }
                id
            }
            None => self.create(key, tokens, entry),
        }
    }

    /// Ingest a batch, sorting it by timestamp first when canonicalization is on.
    pub fn ingest_batch(&mut self, entries: &[LogEntry]) -> Vec<ClusterId> {
        if self.config.canonicalize {
            let mut ordered: Vec<&LogEntry> = entries.iter().collect();
            ordered.sort_by_key(|e| e.timestamp);
            ordered.into_iter().map(|e| self.ingest(e)).collect()
        } else {
            entries.iter().map(|e| self.ingest(e)).collect()
        }
    }

    pub fn get(&self, id: ClusterId) -> Option<&LogCluster> {
        self.clusters.peek(&id)
    }

    /// All clusters ordered by count (desc), then id.
    pub fn snapshot(&self) -> Vec<LogCluster> {
        let mut clusters: Vec<LogCluster> = self
            .clusters
            .iter()
            .map(|(_, cluster)| {
                let mut cluster = cluster.clone();
                cluster.novel = self.is_novel(cluster.id);
                cluster
            })
            .collect();
        clusters.sort_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));
        clusters
    }

    /// Error-dominant or novel clusters, in snapshot order.
    pub fn anomalous(&self) -> Vec<LogCluster> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.novel || c.error_share() >= self.config.error_dominance)
            .collect()
    }

    fn is_novel(&self, id: ClusterId) -> bool {
        self.seeded_below.is_some_and(|boundary| id >= boundary)
    }

    fn best_match(&self, key: &IndexKey, tokens: &[String]) -> Option<ClusterId> {
        let candidates = self.index.get(key)?;
        let mut best: Option<(ClusterId, f64, u64)> = None;
        for id in candidates {
            let Some(cluster) = self.clusters.peek(id) else {
                continue;
            };
            let score = cluster.template.similarity(tokens);
            if score <= self.config.similarity_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, best_score, best_seq)) => {
                    score > best_score || (score == best_score && cluster.last_seq > best_seq)
                }
            };
            if better {
                best = Some((*id, score, cluster.last_seq));
            }
        }
        best.map(|(id, _, _)| id)
    }

    fn create(&mut self, key: IndexKey, tokens: Vec<String>, entry: &LogEntry) -> ClusterId {
        if self.clusters.len() >= self.config.max_clusters {
            if let Some((evicted_id, evicted)) = self.clusters.pop_lru() {
                let evicted_key = index_key(evicted.template.tokens(), self.config.prefix_depth);
                if let Some(bucket) = self.index.get_mut(&evicted_key) {
                    bucket.retain(|id| *id != evicted_id);
                    if bucket.is_empty() {
                        self.index.remove(&evicted_key);
                    }
                }
                self.evicted += 1;
                tracing::debug!(
                    cluster_id = evicted_id,
                    template = %evicted.template,
                    "evicted least recently updated log cluster"
                );
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let mut cluster = LogCluster {
            id,
            template: Template::new(tokens),
            count: 1,
            severity_counts: BTreeMap::from([(entry.severity, 1)]),
            first_seen: entry.timestamp,
            last_updated: entry.timestamp,
            exemplars: Vec::new(),
            trace_ids: BTreeSet::new(),
            span_ids: BTreeSet::new(),
            novel: false,
            last_seq: self.seq,
        };
        remember(&mut cluster, entry, self.config.max_exemplars);
        self.index.entry(key).or_default().push(id);
        self.clusters.put(id, cluster);
        id
    }
}

fn remember(cluster: &mut LogCluster, entry: &LogEntry, cap: usize) {
    cluster.span_ids.extend(entry.span_id.clone());
    let Some(trace_id) = entry.trace_id.as_ref() else {
        return;
    };
    if !cluster.trace_ids.insert(trace_id.clone()) || cluster.exemplars.len() >= cap {
        return;
    }
    cluster.exemplars.push(LogExemplar {
        trace_id: trace_id.clone(),
        span_id: entry.span_id.clone(),
        timestamp: entry.timestamp,
    });
}

/// Whitespace split, delimiter punctuation dropped; `.` stays so addresses remain one token.
pub fn tokenize(message: &str) -> Vec<String> {
    message
        .split(|c: char| c.is_whitespace() || DELIMITERS.contains(&c))
        .map(|t| t.trim_end_matches('.'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn index_key(tokens: &[String], depth: usize) -> IndexKey {
    let prefix = tokens
        .iter()
        .take(depth)
        .map(|t| {
            if t.chars().any(|c| c.is_ascii_digit()) {
                WILDCARD.to_string()
            } else {
                t.clone()
            }
        })
        .collect();
    (tokens.len(), prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn line(seconds: i64, message: &str) -> LogEntry {
        LogEntry::new(at(seconds), Severity::Info, message)
    }

    fn clusterer(max_clusters: usize) -> LogPatternClusterer {
        LogPatternClusterer::new(LogClusteringConfig {
            max_clusters,
            ..LogClusteringConfig::default()
        })
    }

    #[test]
    fn tokenizer_keeps_addresses_whole() {
        assert_eq!(
            tokenize("Error connecting to db at 10.0.0.7."),
            vec!["Error", "connecting", "to", "db", "at", "10.0.0.7"]
        );
        assert_eq!(tokenize("user=alice, status:ok"), vec!["user", "alice", "status", "ok"]);
    }

    #[test]
    fn varying_address_collapses_into_one_template() {
        let mut c = clusterer(100);
        for n in 0..100 {
            c.ingest(&LogEntry::new(
                at(n),
                Severity::Error,
                format!("Error connecting to db at 10.0.0.{}", n),
            ));
        }

        let snapshot = c.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].count, 100);
        assert_eq!(snapshot[0].template.to_string(), "Error connecting to db at <*>");
        assert_eq!(snapshot[0].severity_counts.get(&Severity::Error), Some(&100));
        assert_eq!(snapshot[0].first_seen, at(0));
        assert_eq!(snapshot[0].last_updated, at(99));
    }

    #[test]
    fn similarity_must_exceed_threshold() {
        let mut c = clusterer(100);
        let first = c.ingest(&line(0, "job run alpha beta"));
        let second = c.ingest(&line(1, "job run gamma delta"));
        assert_ne!(first, second);
    }

    #[test]
    fn ties_go_to_most_recently_updated() {
        let mut c = clusterer(100);
        let older = c.ingest(&line(0, "job run alpha beta"));
        let newer = c.ingest(&line(1, "job run gamma delta"));
        let chosen = c.ingest(&line(2, "job run alpha delta"));
        assert_ne!(older, newer);
        assert_eq!(chosen, newer);
        assert_eq!(c.get(newer).unwrap().template.to_string(), "job run <*> delta");
    }

    #[test]
    fn capacity_bound_evicts_least_recently_updated() {
        let mut c = clusterer(2);
        let a = c.ingest(&line(0, "alpha one"));
        let b = c.ingest(&line(1, "beta two three"));
        c.ingest(&line(2, "alpha one"));
        let d = c.ingest(&line(3, "gamma four five six"));

        assert_eq!(c.len(), 2);
        assert_eq!(c.evicted(), 1);
        assert!(c.get(b).is_none());
        assert!(c.get(a).is_some());
        assert!(c.get(d).is_some());

        for i in 0..50 {
            c.ingest(&line(10 + i, &format!("unique{} words {}", "x".repeat(i as usize), i)));
            assert!(c.len() <= 2);
        }
    }

    #[test]
    fn snapshot_orders_by_count() {
        let mut c = clusterer(10);
        c.ingest(&line(0, "rare event"));
        for i in 0..3 {
            c.ingest(&line(i, "common event happened"));
        }
        let snapshot = c.snapshot();
        assert_eq!(snapshot[0].count, 3);
        assert_eq!(snapshot[1].count, 1);
    }

    #[test]
    fn exemplars_are_bounded_and_unique() {
        let mut c = LogPatternClusterer::new(LogClusteringConfig {
            max_exemplars: 2,
            ..LogClusteringConfig::default()
        });
        for trace in ["t1", "t1", "t2", "t3"] {
            c.ingest(&line(0, "payment declined").with_span(trace, "s"));
        }
        let exemplars = &c.snapshot()[0].exemplars;
        let ids: Vec<&str> = exemplars.iter().map(|e| e.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn membership_outlives_the_exemplar_cap() {
        let mut c = LogPatternClusterer::new(LogClusteringConfig {
            max_exemplars: 1,
            ..LogClusteringConfig::default()
        });
        for i in 0..4 {
            let trace = format!("t{}", i);
            c.ingest(&line(i, "payment declined").with_span(&trace, &format!("{}-root", trace)));
        }
        let cluster = &c.snapshot()[0];
        assert_eq!(cluster.exemplars.len(), 1);
        assert_eq!(cluster.trace_ids.len(), 4);
        assert!(cluster.mentions_trace("t3"));
        assert!(cluster.mentions_span("t3-root"));
    }

    #[test]
    fn seeded_clusterer_marks_new_templates_novel() {
        let mut first = clusterer(10);
        first.ingest(&line(0, "cache warmed"));
        let persisted = first.snapshot();

        let mut second =
            LogPatternClusterer::from_snapshot(LogClusteringConfig::default(), persisted);
        let known = second.ingest(&line(5, "cache warmed"));
        let fresh = second.ingest(&line(6, "disk quota exceeded on volume"));

        let snapshot = second.snapshot();
        let known_cluster = snapshot.iter().find(|c| c.id == known).unwrap();
        assert_eq!(known_cluster.count, 2);
        assert!(!known_cluster.novel);
        assert!(snapshot.iter().find(|c| c.id == fresh).unwrap().novel);
        assert_eq!(second.anomalous().len(), 1);
    }

    #[test]
    fn error_dominant_clusters_are_anomalous() {
        let mut c = clusterer(10);
        c.ingest(&LogEntry::new(at(0), Severity::Error, "upstream reset"));
        c.ingest(&line(1, "request served"));
        let anomalous = c.anomalous();
        assert_eq!(anomalous.len(), 1);
        assert_eq!(anomalous[0].template.to_string(), "upstream reset");
    }

    #[test]
    fn canonicalize_makes_batches_order_independent() {
        let config = LogClusteringConfig {
            canonicalize: true,
            ..LogClusteringConfig::default()
        };
        let entries = vec![
            line(2, "job run alpha delta"),
            line(0, "job run alpha beta"),
            line(1, "job run gamma delta"),
        ];
        let mut reversed = entries.clone();
        reversed.reverse();

        let mut a = LogPatternClusterer::new(config.clone());
        a.ingest_batch(&entries);
        let mut b = LogPatternClusterer::new(config);
        b.ingest_batch(&reversed);

        let templates = |c: &LogPatternClusterer| -> Vec<String> {
            c.snapshot().iter().map(|c| c.template.to_string()).collect()
        };
        assert_eq!(templates(&a), templates(&b));
    }

    #[test]
    fn template_serializes_as_string() {
        let mut c = clusterer(10);
        c.ingest(&line(0, "worker 1 started"));
        c.ingest(&line(1, "worker 2 started"));
        let json = serde_json::to_value(c.snapshot()).unwrap();
        assert_eq!(json[0]["template"], "worker <*> started");
        assert_eq!(json[0]["count"], 2);
        assert_eq!(json[0]["severity_counts"]["info"], 2);
    }
}
