use crate::clustering::LogPatternClusterer;
use crate::config::IngestionConfig;
use crate::error::{AnalysisError, Result};
use crate::telemetry::LogEntry;
use crossbeam::channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Bounded log queue drained into a clusterer by a fixed pool of workers.
///
/// Producers block in `submit` while the queue is full, up to the configured
/// timeout. With more than one worker the arrival order at the clusterer is
/// not fixed, so templates may differ between runs.
pub struct LogIngestor {
    sender: Option<Sender<LogEntry>>,
    workers: Vec<JoinHandle<()>>,
    clusterer: Arc<Mutex<LogPatternClusterer>>,
    submit_timeout: Duration,
}

impl LogIngestor {
    pub fn new(config: &IngestionConfig, clusterer: LogPatternClusterer) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);
        let clusterer = Arc::new(Mutex::new(clusterer));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver: Receiver<LogEntry> = receiver.clone();
                let clusterer = Arc::clone(&clusterer);
                std::thread::spawn(move || {
                    for entry in receiver.iter() {
                        lock(&clusterer).ingest(&entry);
                    }
                    tracing::trace!(worker, "log ingestion worker drained");
                })
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            clusterer,
            submit_timeout: Duration::from_millis(config.submit_timeout_ms),
        }
    }

    /// Enqueue one entry, waiting for room up to the submit timeout.
    pub fn submit(&self, entry: LogEntry) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(AnalysisError::IngestionClosed)?;
        sender
            .send_timeout(entry, self.submit_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => AnalysisError::IngestionStalled {
                    timeout_ms: self.submit_timeout.as_millis() as u64,
                },
                SendTimeoutError::Disconnected(_) => AnalysisError::IngestionClosed,
            })
    }

    pub fn pending(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Read the live clusterer; holds the lock (and stalls the workers) for the duration of `f`.
    pub fn with_clusterer<R>(&self, f: impl FnOnce(&LogPatternClusterer) -> R) -> R {
        f(&lock(&self.clusterer))
    }

    /// Close the queue, wait for every queued entry to be clustered and hand the clusterer back.
    pub fn finish(mut self) -> LogPatternClusterer {
        self.close();
        let mut guard = lock(&self.clusterer);
        let config = guard.config().clone();
        std::mem::replace(&mut *guard, LogPatternClusterer::new(config))
    }

    fn close(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("log ingestion worker panicked");
            }
        }
    }
}

impl Drop for LogIngestor {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(clusterer: &Mutex<LogPatternClusterer>) -> MutexGuard<'_, LogPatternClusterer> {
    clusterer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogClusteringConfig;
    use crate::telemetry::Severity;
    use chrono::{TimeZone, Utc};

    fn entry(n: u32) -> LogEntry {
        LogEntry::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            Severity::Warn,
            format!("Error connecting to db at 10.0.0.{}", n),
        )
    }

    #[test]
    fn test_queue_drains_into_clusterer() {
        let ingestor = LogIngestor::new(
            &IngestionConfig::default(),
            LogPatternClusterer::new(LogClusteringConfig::default()),
        );
        for n in 0..100 {
            ingestor.submit(entry(n)).unwrap();
        }
        let clusterer = ingestor.finish();
        let snapshot = clusterer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].count, 100);
    }

    #[test]
    fn test_full_queue_times_out() {
        let config = IngestionConfig {
            queue_capacity: 1,
            workers: 1,
            submit_timeout_ms: 50,
        };
        let ingestor = LogIngestor::new(
            &config,
            LogPatternClusterer::new(LogClusteringConfig::default()),
        );

        // Holding the clusterer lock parks the worker, so the queue cannot drain.
        let results: Vec<Result<()>> =
            ingestor.with_clusterer(|_| (0..3).map(|n| ingestor.submit(entry(n))).collect());

        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AnalysisError::IngestionStalled { timeout_ms: 50 }))));

        let clusterer = ingestor.finish();
        let ingested: u64 = clusterer.snapshot().iter().map(|c| c.count).sum();
        let accepted = results.iter().filter(|r| r.is_ok()).count() as u64;
        assert_eq!(ingested, accepted);
    }
}
