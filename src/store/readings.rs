//! Readings log — bounded, append-only, file-backed
//!
//! A `VecDeque` ring kept in sync with `readings.json`. The cap is global
//! across setups; on overflow the oldest entries fall off. Appends are
//! serialized (single writer per setup by construction — one collector task
//! per setup), readers snapshot concurrently.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::model::Reading;

pub struct ReadingsLog {
    path: PathBuf,
    max_entries: usize,
    ring: RwLock<VecDeque<Reading>>,
    /// Last appended timestamp per setup, for strict monotonicity.
    last_ts: Mutex<HashMap<i64, DateTime<Utc>>>,
    write_gate: Mutex<()>,
}

impl ReadingsLog {
    /// Default global cap on retained readings.
    pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

    /// Load the log from `readings.json` (missing file → empty). A corrupt
    /// file refuses to load.
    pub async fn open(data_dir: &Path, max_entries: usize) -> EngineResult<Self> {
        let path = data_dir.join("readings.json");
        let mut ring: VecDeque<Reading> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<Reading>>(&bytes)
                .map_err(|e| EngineError::Corruption {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?
                .into(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        while ring.len() > max_entries {
            ring.pop_front();
        }

        let mut last_ts = HashMap::new();
        for reading in &ring {
            let entry = last_ts.entry(reading.setup_id).or_insert(reading.timestamp);
            if reading.timestamp > *entry {
                *entry = reading.timestamp;
            }
        }

        Ok(Self {
            path,
            max_entries,
            ring: RwLock::new(ring),
            last_ts: Mutex::new(last_ts),
            write_gate: Mutex::new(()),
        })
    }

    /// Append a reading, trimming to the cap and flushing the file.
    ///
    /// The stored timestamp is forced strictly past the previous one for
    /// the same setup (bumped by 1 µs on an equal-or-backwards clock read).
    /// Returns the reading as stored.
    pub async fn append(&self, mut reading: Reading) -> EngineResult<Reading> {
        let _gate = self.write_gate.lock().await;

        {
            let mut last_ts = self.last_ts.lock().await;
            if let Some(prev) = last_ts.get(&reading.setup_id) {
                if reading.timestamp <= *prev {
                    reading.timestamp = *prev + ChronoDuration::microseconds(1);
                }
            }
            last_ts.insert(reading.setup_id, reading.timestamp);
        }

        let snapshot: Vec<Reading> = {
            let mut ring = self.ring.write().await;
            ring.push_back(reading.clone());
            while ring.len() > self.max_entries {
                ring.pop_front();
            }
            ring.iter().cloned().collect()
        };

        persist(&self.path, &snapshot).await?;
        Ok(reading)
    }

    /// Most recent `k` readings for a setup, newest first.
    pub async fn latest(&self, setup_id: i64, k: usize) -> Vec<Reading> {
        self.ring
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.setup_id == setup_id)
            .take(k)
            .cloned()
            .collect()
    }

    /// Readings for a setup not older than `age`, newest first.
    pub async fn since(&self, setup_id: i64, age: std::time::Duration) -> Vec<Reading> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(age).unwrap_or_else(|_| ChronoDuration::seconds(0));
        self.ring
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.setup_id == setup_id && r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Newest-first slice across setups; `setup_id` filters when given.
    pub async fn list(&self, setup_id: Option<i64>, limit: usize) -> Vec<Reading> {
        self.ring
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| setup_id.map_or(true, |id| r.setup_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.ring.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ring.read().await.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

async fn persist(path: &Path, readings: &[Reading]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(readings).map_err(EngineError::internal)?;
    let tmp = path.with_file_name("readings.json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(setup_id: i64) -> Reading {
        Reading {
            timestamp: Utc::now(),
            setup_id,
            setup_name: format!("setup-{setup_id}"),
            targets: vec![],
        }
    }

    #[tokio::test]
    async fn test_cap_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReadingsLog::open(dir.path(), 10).await.unwrap();

        for _ in 0..25 {
            log.append(reading(1)).await.unwrap();
        }

        assert_eq!(log.len().await, 10);
        let latest = log.latest(1, 25).await;
        assert_eq!(latest.len(), 10);
        // Newest first, strictly decreasing timestamps.
        for pair in latest.windows(2) {
            assert!(pair[0].timestamp > pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_timestamps_strictly_monotonic_per_setup() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReadingsLog::open(dir.path(), 100).await.unwrap();

        let fixed = Utc::now();
        for _ in 0..5 {
            let mut r = reading(1);
            r.timestamp = fixed; // identical clock reads
            log.append(r).await.unwrap();
        }

        let stored = log.latest(1, 5).await;
        for pair in stored.windows(2) {
            assert!(pair[0].timestamp > pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_latest_filters_by_setup() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReadingsLog::open(dir.path(), 100).await.unwrap();

        log.append(reading(1)).await.unwrap();
        log.append(reading(2)).await.unwrap();
        log.append(reading(1)).await.unwrap();

        assert_eq!(log.latest(1, 10).await.len(), 2);
        assert_eq!(log.latest(2, 10).await.len(), 1);
        assert_eq!(log.list(None, 10).await.len(), 3);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = ReadingsLog::open(dir.path(), 100).await.unwrap();
            log.append(reading(1)).await.unwrap();
            log.append(reading(1)).await.unwrap();
        }
        let reopened = ReadingsLog::open(dir.path(), 100).await.unwrap();
        assert_eq!(reopened.len().await, 2);
    }

    #[tokio::test]
    async fn test_reopen_applies_cap() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = ReadingsLog::open(dir.path(), 100).await.unwrap();
            for _ in 0..20 {
                log.append(reading(1)).await.unwrap();
            }
        }
        let reopened = ReadingsLog::open(dir.path(), 5).await.unwrap();
        assert_eq!(reopened.len().await, 5);
    }

    #[tokio::test]
    async fn test_corrupt_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("readings.json"), b"[1, 2,")
            .await
            .unwrap();
        assert!(matches!(
            ReadingsLog::open(dir.path(), 10).await,
            Err(EngineError::Corruption { .. })
        ));
    }
}
