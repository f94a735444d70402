use super::store::{DailyStats, EmergencyStopState, StateError, StateStore};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Who latches the breaker when the daily loss ceiling is crossed.
pub const LOSS_LATCH_ACTOR: &str = "risk_manager:DAILY_LOSS_LIMIT";

/// In-memory view of the persisted risk state.
///
/// Daily stats are cached and written through on every change. The emergency
/// stop is re-read from the store on each check so an operator can set it
/// while the process runs.
pub struct RiskState {
    store: Arc<dyn StateStore>,
    daily: Mutex<DailyStats>,
}

impl RiskState {
    /// Load today's (UTC) stats, starting fresh when none are persisted.
    pub fn load(store: Arc<dyn StateStore>) -> Result<Self, StateError> {
        Self::load_for(store, Utc::now().date_naive())
    }

    pub fn load_for(store: Arc<dyn StateStore>, today: NaiveDate) -> Result<Self, StateError> {
        let daily = match store.load_daily(today)? {
            Some(stats) if stats.date == today => stats,
            Some(stale) => {
                warn!(persisted = %stale.date, today = %today, "Persisted stats are for another day, resetting");
                DailyStats::new(today)
            }
            None => DailyStats::new(today),
        };
        info!(
            date = %daily.date,
            attempts = daily.attempts,
            loss_usd = daily.total_loss_usd,
            net_usd = daily.net_profit_usd,
            "Daily risk stats loaded"
        );
        Ok(Self {
            store,
            daily: Mutex::new(daily),
        })
    }

    /// Reset the counters once when the UTC date has moved on.
    fn roll(&self, daily: &mut DailyStats, today: NaiveDate) {
        if daily.date != today {
            info!(previous = %daily.date, today = %today, "UTC day rolled, resetting daily stats");
            *daily = DailyStats::new(today);
            if let Err(e) = self.store.save_daily(daily) {
                error!(error = %e, "Failed to persist reset daily stats");
            }
        }
    }

    /// Current stats, rolled to `today`.
    pub fn daily_for(&self, today: NaiveDate) -> DailyStats {
        let mut daily = self.daily.lock();
        self.roll(&mut daily, today);
        daily.clone()
    }

    pub fn daily(&self) -> DailyStats {
        self.daily_for(Utc::now().date_naive())
    }

    /// Fold one attempt into today's stats and persist them.
    pub fn record_attempt(&self, success: bool, pnl_usd: f64) -> Result<DailyStats, StateError> {
        self.record_attempt_on(Utc::now().date_naive(), success, pnl_usd)
    }

    pub fn record_attempt_on(
        &self,
        today: NaiveDate,
        success: bool,
        pnl_usd: f64,
    ) -> Result<DailyStats, StateError> {
        let mut daily = self.daily.lock();
        self.roll(&mut daily, today);
        daily.record(success, pnl_usd);
        self.store.save_daily(&daily)?;
        Ok(daily.clone())
    }

    pub fn emergency_stop(&self) -> Result<EmergencyStopState, StateError> {
        self.store.load_emergency_stop()
    }

    /// Latch the breaker. Only [`RiskState::clear_emergency_stop`] undoes it.
    pub fn activate_emergency_stop(
        &self,
        reason: impl Into<String>,
        activated_by: impl Into<String>,
    ) -> Result<EmergencyStopState, StateError> {
        let state = EmergencyStopState::active(reason, activated_by);
        self.store.save_emergency_stop(&state)?;
        warn!(
            reason = state.reason.as_deref().unwrap_or_default(),
            activated_by = state.activated_by.as_deref().unwrap_or_default(),
            "EMERGENCY STOP ACTIVATED"
        );
        Ok(state)
    }

    /// Operator action.
    pub fn clear_emergency_stop(&self) -> Result<(), StateError> {
        self.store.reset_emergency_stop()?;
        info!("Emergency stop cleared");
        Ok(())
    }
}
