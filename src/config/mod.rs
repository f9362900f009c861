use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    ledger::Amount,
    tier::{TierError, TierThresholds},
};

/// Upper bound for the buyer rewards percentage (10%).
pub const MAX_REWARDS_PERCENTAGE_BP: u16 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Thresholds(#[from] TierError),
    #[error("rewards percentage {0} bp exceeds the {max} bp maximum", max = MAX_REWARDS_PERCENTAGE_BP)]
    InvalidRewardsPercentage(u16),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProgramConfig {
    pub thresholds: TierThresholds,
    pub min_holdings_for_referral: Amount,
    /// Buyer reward on each purchase, basis points.
    pub rewards_percentage_bp: u16,
    /// Referrer base rate before holding ratio and multiplier, basis points.
    pub base_reward_rate_bp: u16,
    pub min_purchase_amount: Amount,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            min_holdings_for_referral: 1_000_000,
            rewards_percentage_bp: 200,
            base_reward_rate_bp: 500,
            min_purchase_amount: 1,
        }
    }
}

impl ProgramConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: ProgramConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        if self.rewards_percentage_bp > MAX_REWARDS_PERCENTAGE_BP {
            return Err(ConfigError::InvalidRewardsPercentage(
                self.rewards_percentage_bp,
            ));
        }
        Ok(())
    }

    /// Applies `update` to a copy, validates it and only then commits.
    pub fn apply(&mut self, update: &ParamsUpdate) -> Result<(), ConfigError> {
        let mut next = self.clone();
        if let Some(percentage) = update.rewards_percentage_bp {
            next.rewards_percentage_bp = percentage;
        }
        if let Some(amount) = update.min_purchase_amount {
            next.min_purchase_amount = amount;
        }
        if let Some([bronze, silver, gold]) = update.tier_thresholds {
            next.thresholds = TierThresholds {
                bronze,
                silver,
                gold,
            };
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ParamsUpdate {
    pub rewards_percentage_bp: Option<u16>,
    pub min_purchase_amount: Option<Amount>,
    /// `[bronze, silver, gold]`
    pub tier_thresholds: Option<[Amount; 3]>,
}

impl ParamsUpdate {
    pub fn is_empty(&self) -> bool {
        self.rewards_percentage_bp.is_none()
            && self.min_purchase_amount.is_none()
            && self.tier_thresholds.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("otto-config-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let path = temp_path("partial");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(br#"{"min_holdings_for_referral": 42, "thresholds": {"bronze": 1, "silver": 2, "gold": 3}}"#)
            .unwrap();
        let config = ProgramConfig::load(&path).unwrap();
        assert_eq!(config.min_holdings_for_referral, 42);
        assert_eq!(config.thresholds.gold, 3);
        assert_eq!(config.base_reward_rate_bp, 500);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn misordered_thresholds_fail_at_load() {
        let path = temp_path("misordered");
        fs::write(
            &path,
            br#"{"thresholds": {"bronze": 10, "silver": 5, "gold": 20}}"#,
        )
        .unwrap();
        let err = ProgramConfig::load(&path).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Thresholds(TierError::InvalidThresholds { .. })
        ));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = ProgramConfig::load(Path::new("/nonexistent/otto.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn update_is_all_or_nothing() {
        let mut config = ProgramConfig::default();
        let err = config
            .apply(&ParamsUpdate {
                rewards_percentage_bp: Some(300),
                min_purchase_amount: Some(10),
                tier_thresholds: Some([3, 2, 1]),
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Thresholds(_)));
        assert_eq!(config, ProgramConfig::default());

        let err = config
            .apply(&ParamsUpdate {
                rewards_percentage_bp: Some(1_001),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRewardsPercentage(1_001)));

        config
            .apply(&ParamsUpdate {
                rewards_percentage_bp: Some(1_000),
                tier_thresholds: Some([10, 20, 30]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.rewards_percentage_bp, 1_000);
        assert_eq!(config.thresholds.silver, 20);
    }
}
