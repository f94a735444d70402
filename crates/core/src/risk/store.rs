//! Persisted risk state.
//!
//! Layout under the state directory:
//!
//! ```text
//! daily-stats-YYYY-MM-DD.json   one document per UTC day
//! EMERGENCY_STOP                presence = active; optional JSON body
//! ```
//!
//! A single process bound to one signing key owns the directory. There is
//! no locking between writers.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const EMERGENCY_STOP_FILE: &str = "EMERGENCY_STOP";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Attempt counters and realized P&L for one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub date: NaiveDate,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_profit_usd: f64,
    pub total_loss_usd: f64,
    pub net_profit_usd: f64,
}

impl DailyStats {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            attempts: 0,
            successes: 0,
            failures: 0,
            total_profit_usd: 0.0,
            total_loss_usd: 0.0,
            net_profit_usd: 0.0,
        }
    }

    /// Count one attempt and fold its realized P&L into the totals.
    pub fn record(&mut self, success: bool, pnl_usd: f64) {
        self.attempts += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if pnl_usd > 0.0 {
            self.total_profit_usd += pnl_usd;
        } else if pnl_usd < 0.0 {
            self.total_loss_usd += -pnl_usd;
        }
        self.net_profit_usd = self.total_profit_usd - self.total_loss_usd;
    }
}

/// Emergency stop breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopState {
    #[serde(skip)]
    pub is_active: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activated_by: Option<String>,
}

impl EmergencyStopState {
    pub fn active(reason: impl Into<String>, activated_by: impl Into<String>) -> Self {
        Self {
            is_active: true,
            reason: Some(reason.into()),
            activated_at: Some(Utc::now()),
            activated_by: Some(activated_by.into()),
        }
    }
}

/// Single-writer persistence for risk state.
pub trait StateStore: Send + Sync {
    fn load_daily(&self, date: NaiveDate) -> Result<Option<DailyStats>, StateError>;
    fn save_daily(&self, stats: &DailyStats) -> Result<(), StateError>;
    fn load_emergency_stop(&self) -> Result<EmergencyStopState, StateError>;
    fn save_emergency_stop(&self, state: &EmergencyStopState) -> Result<(), StateError>;
    fn reset_emergency_stop(&self) -> Result<(), StateError>;
}

/// JSON files in one directory.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    /// Open (and create) the state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StateError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn daily_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("daily-stats-{}.json", date.format("%Y-%m-%d")))
    }

    pub fn emergency_stop_path(&self) -> PathBuf {
        self.dir.join(EMERGENCY_STOP_FILE)
    }

    /// Write to a sibling temp file then rename over the target.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StateError> {
        let tmp = path.with_extension("tmp");
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    fn read_optional(path: &Path) -> Result<Option<String>, StateError> {
        match fs::read_to_string(path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl StateStore for JsonStateStore {
    fn load_daily(&self, date: NaiveDate) -> Result<Option<DailyStats>, StateError> {
        let path = self.daily_path(date);
        let Some(body) = Self::read_optional(&path)? else {
            return Ok(None);
        };
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| StateError::Corrupt { path, source })
    }

    fn save_daily(&self, stats: &DailyStats) -> Result<(), StateError> {
        let path = self.daily_path(stats.date);
        let body = serde_json::to_vec_pretty(stats).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.write_atomic(&path, &body)
    }

    fn load_emergency_stop(&self) -> Result<EmergencyStopState, StateError> {
        let path = self.emergency_stop_path();
        let Some(body) = Self::read_optional(&path)? else {
            return Ok(EmergencyStopState::default());
        };

        // An operator may simply `touch` the file
        let mut state = if body.trim().is_empty() {
            EmergencyStopState::default()
        } else {
            serde_json::from_str(&body).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Unparseable emergency stop body, treating as active");
                EmergencyStopState::default()
            })
        };
        state.is_active = true;
        if state.reason.is_none() {
            state.reason = Some("manual".to_string());
        }
        Ok(state)
    }

    fn save_emergency_stop(&self, state: &EmergencyStopState) -> Result<(), StateError> {
        let path = self.emergency_stop_path();
        let body = serde_json::to_vec_pretty(state).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.write_atomic(&path, &body)
    }

    fn reset_emergency_stop(&self) -> Result<(), StateError> {
        let path = self.emergency_stop_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_daily_stats_file_name_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path()).unwrap();

        assert_eq!(store.load_daily(day(5)).unwrap(), None);

        let mut stats = DailyStats::new(day(5));
        stats.record(true, 42.5);
        stats.record(false, -10.0);
        store.save_daily(&stats).unwrap();

        assert!(dir.path().join("daily-stats-2026-03-05.json").exists());
        let loaded = store.load_daily(day(5)).unwrap().unwrap();
        assert_eq!(loaded, stats);
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.net_profit_usd, 32.5);
        assert_eq!(store.load_daily(day(6)).unwrap(), None);
    }

    #[test]
    fn test_daily_stats_json_is_camel_case() {
        let mut stats = DailyStats::new(day(1));
        stats.record(false, -3.0);
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["date"], "2026-03-01");
        assert_eq!(value["totalLossUsd"], 3.0);
        assert_eq!(value["failures"], 1);
    }

    #[test]
    fn test_emergency_stop_presence_based() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path()).unwrap();
        assert!(!store.load_emergency_stop().unwrap().is_active);

        // Operator touches an empty file
        std::fs::write(dir.path().join(EMERGENCY_STOP_FILE), "").unwrap();
        let state = store.load_emergency_stop().unwrap();
        assert!(state.is_active);
        assert_eq!(state.reason.as_deref(), Some("manual"));

        store.reset_emergency_stop().unwrap();
        assert!(!store.load_emergency_stop().unwrap().is_active);
        // Idempotent
        store.reset_emergency_stop().unwrap();
    }

    #[test]
    fn test_emergency_stop_body_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path()).unwrap();

        store
            .save_emergency_stop(&EmergencyStopState::active("loss", "risk_manager:DAILY_LOSS_LIMIT"))
            .unwrap();
        let body = std::fs::read_to_string(dir.path().join(EMERGENCY_STOP_FILE)).unwrap();
        assert!(body.contains("activatedBy"));

        let state = store.load_emergency_stop().unwrap();
        assert!(state.is_active);
        assert_eq!(state.activated_by.as_deref(), Some("risk_manager:DAILY_LOSS_LIMIT"));
        assert!(state.activated_at.is_some());
    }

    #[test]
    fn test_garbage_body_still_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join(EMERGENCY_STOP_FILE), "stop everything").unwrap();
        assert!(store.load_emergency_stop().unwrap().is_active);
    }

    #[test]
    fn test_corrupt_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::open(dir.path()).unwrap();
        std::fs::write(store.daily_path(day(2)), "{").unwrap();
        assert!(matches!(store.load_daily(day(2)), Err(StateError::Corrupt { .. })));
    }
}
