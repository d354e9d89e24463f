use crate::config::AnomalyDetectionConfig;
use crate::error::{AnalysisError, Result};
use crate::telemetry::{MetricSeries, TimeWindow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contiguous run of anomalous points, possibly spanning several series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub series: Vec<String>,
    /// Largest absolute deviation from the baseline median inside the window
    pub severity: f64,
    pub points: usize,
}

impl AnomalyWindow {
    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.start, self.end)
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Robust location and spread of a baseline window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub median: f64,
    pub mad: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeriesStatus {
    Ok { windows: usize },
    InsufficientData { found: usize, required: usize },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiSeriesDetection {
    pub windows: Vec<AnomalyWindow>,
    pub statuses: BTreeMap<String, SeriesStatus>,
}

impl MultiSeriesDetection {
    /// True when no series had enough baseline data to be scored.
    pub fn all_insufficient(&self) -> bool {
        !self.statuses.is_empty()
            && self
                .statuses
                .values()
                .all(|s| matches!(s, SeriesStatus::InsufficientData { .. }))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricAnomalyDetector {
    config: AnomalyDetectionConfig,
}

impl MetricAnomalyDetector {
    pub fn new(config: AnomalyDetectionConfig) -> Self {
        Self { config }
    }

    pub fn baseline(&self, baseline: &MetricSeries) -> Result<Baseline> {
        let values = baseline.values();
        if values.len() < self.config.min_samples {
            return Err(AnalysisError::InsufficientData {
                series: baseline.key(),
                found: values.len(),
                required: self.config.min_samples,
            });
        }
        let center = median(&values);
        let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
        Ok(Baseline {
            median: center,
            mad: median(&deviations),
            samples: values.len(),
        })
    }

    /// The comparison window with each point's derived `anomaly` flag set.
    pub fn flag_points(
        &self,
        baseline: &MetricSeries,
        comparison: &MetricSeries,
    ) -> Result<MetricSeries> {
        let stats = self.baseline(baseline)?;
        let mut flagged = comparison.clone();
        for point in flagged.points.iter_mut() {
            point.anomaly = self.is_anomalous(&stats, point.value);
        }
        Ok(flagged)
    }

    pub fn detect(
        &self,
        baseline: &MetricSeries,
        comparison: &MetricSeries,
    ) -> Result<Vec<AnomalyWindow>> {
        let stats = self.baseline(baseline)?;
        let gap = self.merge_gap(baseline, comparison);
        let key = comparison.key();

        let mut windows: Vec<AnomalyWindow> = Vec::new();
        for point in &comparison.points {
            if !self.is_anomalous(&stats, point.value) {
                continue;
            }
            let deviation = (point.value - stats.median).abs();
            match windows.last_mut() {
                Some(open) if point.timestamp - open.end <= gap => {
                    open.end = point.timestamp;
                    open.severity = open.severity.max(deviation);
                    open.points += 1;
                }
                _ => windows.push(AnomalyWindow {
                    start: point.timestamp,
                    end: point.timestamp,
                    series: vec![key.clone()],
                    severity: deviation,
                    points: 1,
                }),
            }
        }

        tracing::debug!(
            series = %key,
            median = stats.median,
            mad = stats.mad,
            windows = windows.len(),
            "metric series scored"
        );
        Ok(windows)
    }

    /// Score every series, splitting each at `comparison_start`, and merge
    /// windows that overlap across series into incidents.
    pub fn detect_many(
        &self,
        series: &[MetricSeries],
        comparison_start: DateTime<Utc>,
    ) -> MultiSeriesDetection {
        let mut detection = MultiSeriesDetection::default();
        let mut windows = Vec::new();

        for s in series {
            let (baseline, comparison) = s.split_at(comparison_start);
            match self.detect(&baseline, &comparison) {
                Ok(found) => {
                    detection
                        .statuses
                        .insert(s.key(), SeriesStatus::Ok { windows: found.len() });
                    windows.extend(found);
                }
                Err(AnalysisError::InsufficientData {
                    found, required, ..
                }) => {
                    detection
                        .statuses
                        .insert(s.key(), SeriesStatus::InsufficientData { found, required });
                }
                Err(other) => {
                    tracing::warn!(series = %s.key(), error = %other, "metric series skipped");
                }
            }
        }

        detection.windows = merge_incidents(windows);
        detection
    }

    fn is_anomalous(&self, stats: &Baseline, value: f64) -> bool {
        let deviation = (value - stats.median).abs();
        if stats.mad > 0.0 {
            deviation > self.config.mad_multiplier * stats.mad
        } else {
            deviation > 0.0
        }
    }

    fn merge_gap(&self, baseline: &MetricSeries, comparison: &MetricSeries) -> Duration {
        if let Some(ms) = self.config.merge_gap_ms {
            return Duration::milliseconds(ms as i64);
        }
        sample_interval(comparison)
            .or_else(|| sample_interval(baseline))
            .unwrap_or_else(Duration::zero)
    }
}

/// Merge windows whose time ranges intersect; the result is ordered by start.
pub fn merge_incidents(mut windows: Vec<AnomalyWindow>) -> Vec<AnomalyWindow> {
    windows.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    let mut merged: Vec<AnomalyWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.last_mut() {
            Some(current) if window.start <= current.end => {
                current.end = current.end.max(window.end);
                current.severity = current.severity.max(window.severity);
                current.points += window.points;
                current.series.extend(window.series);
                current.series.sort();
                current.series.dedup();
            }
            _ => merged.push(window),
        }
    }
    merged
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median spacing between consecutive points.
fn sample_interval(series: &MetricSeries) -> Option<Duration> {
    let gaps: Vec<f64> = series
        .points
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64)
        .collect();
    if gaps.is_empty() {
        None
    } else {
        Some(Duration::milliseconds(median(&gaps).round() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MetricPoint;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    /// One point every 10 seconds beginning at `offset` samples.
    fn series(name: &str, offset: i64, values: &[f64]) -> MetricSeries {
        MetricSeries::new(
            name,
            values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    MetricPoint::new(start() + Duration::seconds((offset + i as i64) * 10), *v)
                })
                .collect(),
        )
    }

    fn noisy_baseline(name: &str) -> MetricSeries {
        series(
            name,
            0,
            &[100.0, 101.0, 99.0, 100.0, 102.0, 98.0, 100.0, 101.0, 99.0, 100.0, 100.0, 101.0],
        )
    }

    #[test]
    fn constant_series_never_anomalous() {
        let baseline = series("cpu", 0, &[5.0; 20]);
        let comparison = series("cpu", 20, &[5.0; 20]);
        for multiplier in [0.001, 1.0, 3.0, 1000.0] {
            let detector = MetricAnomalyDetector::new(AnomalyDetectionConfig {
                mad_multiplier: multiplier,
                ..AnomalyDetectionConfig::default()
            });
            assert!(detector.detect(&baseline, &comparison).unwrap().is_empty());
        }
    }

    #[test]
    fn zero_mad_flags_any_deviation() {
        let baseline = series("queue", 0, &[0.0; 12]);
        let comparison = series("queue", 12, &[0.0, 0.0, 1.0, 0.0]);
        let windows = MetricAnomalyDetector::default()
            .detect(&baseline, &comparison)
            .unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].severity, 1.0);
    }

    #[test]
    fn adjacent_spikes_merge_into_one_window() {
        let baseline = noisy_baseline("latency");
        let comparison = series("latency", 12, &[100.0, 180.0, 240.0, 190.0, 100.0, 101.0, 300.0]);
        let windows = MetricAnomalyDetector::default()
            .detect(&baseline, &comparison)
            .unwrap();

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].points, 3);
        assert_eq!(windows[0].start, start() + Duration::seconds(130));
        assert_eq!(windows[0].end, start() + Duration::seconds(150));
        assert!((windows[0].severity - 140.0).abs() < 1e-9);
        assert_eq!(windows[1].points, 1);
        assert_eq!(windows[1].series, vec!["latency".to_string()]);
    }

    #[test]
    fn flag_points_marks_only_outliers() {
        let baseline = noisy_baseline("latency");
        let comparison = series("latency", 12, &[100.0, 250.0, 99.0]);
        let flagged = MetricAnomalyDetector::default()
            .flag_points(&baseline, &comparison)
            .unwrap();
        let flags: Vec<bool> = flagged.points.iter().map(|p| p.anomaly).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn short_baseline_is_insufficient() {
        let baseline = series("cpu", 0, &[1.0; 9]);
        let comparison = series("cpu", 9, &[50.0]);
        let err = MetricAnomalyDetector::default()
            .detect(&baseline, &comparison)
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::InsufficientData { found: 9, required: 10, .. }
        ));
    }

    #[test]
    fn overlapping_windows_across_series_become_one_incident() {
        let mut values = vec![100.0, 101.0, 99.0, 100.0, 102.0, 98.0, 100.0, 101.0, 99.0, 100.0];
        let mut latency = values.clone();
        latency.extend([100.0, 400.0, 420.0, 100.0]);
        let mut errors = values.clone();
        errors.extend([100.0, 100.0, 300.0, 320.0]);
        values.extend([100.0; 4]);

        let comparison_start = start() + Duration::seconds(100);
        let detection = MetricAnomalyDetector::default().detect_many(
            &[
                series("latency", 0, &latency),
                series("errors", 0, &errors),
                series("rps", 0, &values),
                series("fresh", 9, &[1.0, 2.0, 3.0]),
            ],
            comparison_start,
        );

        assert_eq!(detection.windows.len(), 1);
        let incident = &detection.windows[0];
        assert_eq!(incident.series, vec!["errors".to_string(), "latency".to_string()]);
        assert_eq!(incident.start, start() + Duration::seconds(110));
        assert_eq!(incident.end, start() + Duration::seconds(130));
        assert!((incident.severity - 320.0).abs() < 1e-9);
        assert_eq!(
            detection.statuses.get("fresh"),
            Some(&SeriesStatus::InsufficientData { found: 1, required: 10 })
        );
        assert_eq!(detection.statuses.get("rps"), Some(&SeriesStatus::Ok { windows: 0 }));
        assert!(!detection.all_insufficient());
    }
}
