use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Pipeline stage that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCheckType {
    EmergencyStop,
    DailyLossLimit,
    GasPrice,
    TokenWhitelist,
    TokenBlacklist,
    InsufficientBalance,
    HealthFactorChanged,
    PositionTooSmall,
    PositionTooLarge,
}

impl RiskCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmergencyStop => "EMERGENCY_STOP",
            Self::DailyLossLimit => "DAILY_LOSS_LIMIT",
            Self::GasPrice => "GAS_PRICE",
            Self::TokenWhitelist => "TOKEN_WHITELIST",
            Self::TokenBlacklist => "TOKEN_BLACKLIST",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::HealthFactorChanged => "HEALTH_FACTOR_CHANGED",
            Self::PositionTooSmall => "POSITION_TOO_SMALL",
            Self::PositionTooLarge => "POSITION_TOO_LARGE",
        }
    }
}

impl fmt::Display for RiskCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskCheckResult {
    pub passed: bool,
    pub check_type: RiskCheckType,
    pub reason: String,
    #[serde(default)]
    pub details: Value,
}

impl RiskCheckResult {
    pub fn pass(check_type: RiskCheckType, details: Value) -> Self {
        Self {
            passed: true,
            check_type,
            reason: "ok".to_string(),
            details,
        }
    }

    pub fn fail(check_type: RiskCheckType, reason: impl Into<String>, details: Value) -> Self {
        Self {
            passed: false,
            check_type,
            reason: reason.into(),
            details,
        }
    }
}

/// All stage outcomes for one candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskValidationResult {
    pub can_proceed: bool,
    pub results: Vec<RiskCheckResult>,
}

impl RiskValidationResult {
    pub fn from_results(results: Vec<RiskCheckResult>) -> Self {
        Self {
            can_proceed: results.iter().all(|r| r.passed),
            results,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &RiskCheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn failed(&self, check_type: RiskCheckType) -> bool {
        self.failures().any(|r| r.check_type == check_type)
    }

    /// Comma-separated failed check types, for logging.
    pub fn failure_summary(&self) -> String {
        self.failures()
            .map(|r| r.check_type.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&RiskCheckType::HealthFactorChanged).unwrap();
        assert_eq!(json, r#""HEALTH_FACTOR_CHANGED""#);
        for t in [
            RiskCheckType::EmergencyStop,
            RiskCheckType::DailyLossLimit,
            RiskCheckType::InsufficientBalance,
            RiskCheckType::PositionTooLarge,
        ] {
            assert_eq!(serde_json::to_string(&t).unwrap(), format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_can_proceed_iff_no_failures() {
        let ok = RiskValidationResult::from_results(vec![
            RiskCheckResult::pass(RiskCheckType::GasPrice, json!({})),
            RiskCheckResult::pass(RiskCheckType::PositionTooSmall, json!({})),
        ]);
        assert!(ok.can_proceed);
        assert_eq!(ok.failure_summary(), "");

        let rejected = RiskValidationResult::from_results(vec![
            RiskCheckResult::pass(RiskCheckType::GasPrice, json!({})),
            RiskCheckResult::fail(RiskCheckType::TokenBlacklist, "blocked", json!({"token": "0x01"})),
        ]);
        assert!(!rejected.can_proceed);
        assert!(rejected.failed(RiskCheckType::TokenBlacklist));
        assert!(!rejected.failed(RiskCheckType::GasPrice));
        assert_eq!(rejected.failure_summary(), "TOKEN_BLACKLIST");
    }

    #[test]
    fn test_result_json_shape() {
        let result = RiskCheckResult::fail(RiskCheckType::GasPrice, "too high", json!({"currentGwei": 6.0}));
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["checkType"], "GAS_PRICE");
        assert_eq!(value["passed"], false);
        assert_eq!(value["details"]["currentGwei"], 6.0);
    }
}
