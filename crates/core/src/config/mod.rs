//! Engine configuration.
//!
//! This module provides:
//! - Runtime configuration with named profiles (testing, production, aggressive)
//! - TOML loading with `${VAR}` expansion from the environment
//! - Consistency validation

mod engine;

pub use engine::{
    EngineConfig, ExecutionConfig, LendingAddresses, MarginAddresses, MonitorConfig,
    ProtocolConfig, RelayConfig, RiskConfig, SyntheticToken,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("bad env pattern: {0}")]
    Pattern(String),
}

/// Expand `${VAR_NAME}` patterns with environment variable values.
///
/// Unset variables are left as-is so the parse error names them.
pub fn expand_env(s: &str) -> Result<String, ConfigError> {
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Pattern(e.to_string()))?;
    let mut result = s.to_string();

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            if let Ok(value) = std::env::var(var_match.as_str()) {
                result = result.replace(full_match.as_str(), &value);
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env() {
        // Unique var names to avoid conflicts with parallel tests
        std::env::set_var("ENGINE_CFG_TEST_TOKEN", "secret");
        assert_eq!(
            expand_env("auth_token = \"${ENGINE_CFG_TEST_TOKEN}\"").unwrap(),
            "auth_token = \"secret\""
        );
        assert_eq!(
            expand_env("x = \"${ENGINE_CFG_TEST_UNSET}\"").unwrap(),
            "x = \"${ENGINE_CFG_TEST_UNSET}\""
        );
        assert_eq!(expand_env("plain").unwrap(), "plain");
    }
}
