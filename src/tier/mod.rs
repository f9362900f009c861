use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::Amount;

pub const TOKEN_DECIMALS_SCALE: u64 = 1_000_000; // 1 OTTO = 1e6 base units

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierError {
    #[error("tier thresholds must be non-decreasing (bronze {bronze} <= silver {silver} <= gold {gold})")]
    InvalidThresholds { bronze: Amount, silver: Amount, gold: Amount },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Tier {
    #[default]
    None,
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::None, Tier::Bronze, Tier::Silver, Tier::Gold];

    /// The tier a holder works towards next. Gold is its own successor.
    pub fn next(self) -> Tier {
        match self {
            Tier::None => Tier::Bronze,
            Tier::Bronze => Tier::Silver,
            Tier::Silver | Tier::Gold => Tier::Gold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::None => "None",
            Tier::Bronze => "Bronze",
            Tier::Silver => "Silver",
            Tier::Gold => "Gold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holding thresholds in base token units.
///
/// Deserialization does not check ordering; call [`TierThresholds::validate`]
/// (done by config loading) before trusting a value read from outside.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierThresholds {
    pub bronze: Amount,
    pub silver: Amount,
    pub gold: Amount,
}

impl TierThresholds {
    pub fn new(bronze: Amount, silver: Amount, gold: Amount) -> Result<Self, TierError> {
        let thresholds = Self {
            bronze,
            silver,
            gold,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn from_array(values: [Amount; 3]) -> Result<Self, TierError> {
        Self::new(values[0], values[1], values[2])
    }

    pub fn validate(&self) -> Result<(), TierError> {
        if self.bronze <= self.silver && self.silver <= self.gold {
            Ok(())
        } else {
            Err(TierError::InvalidThresholds {
                bronze: self.bronze,
                silver: self.silver,
                gold: self.gold,
            })
        }
    }

    pub fn threshold_for(&self, tier: Tier) -> Amount {
        match tier {
            Tier::None => 0,
            Tier::Bronze => self.bronze,
            Tier::Silver => self.silver,
            Tier::Gold => self.gold,
        }
    }
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            bronze: 1_000_000,
            silver: 5_000_000,
            gold: 10_000_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TierProgress {
    pub current: Amount,
    pub next: Amount,
    pub percentage: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EligibilityCheck {
    pub is_eligible: bool,
    pub current_holdings: Amount,
    pub required_holdings: Amount,
    pub shortfall: Option<Amount>,
}

/// Descending `>=` tests, gold first. Thresholds are not re-validated here.
pub fn classify_tier(balance: Amount, thresholds: &TierThresholds) -> Tier {
    if balance >= thresholds.gold {
        Tier::Gold
    } else if balance >= thresholds.silver {
        Tier::Silver
    } else if balance >= thresholds.bronze {
        Tier::Bronze
    } else {
        Tier::None
    }
}

/// Progress towards the next absolute threshold, as a share of that
/// threshold's raw value (not of the gap between tiers).
///
/// At or above gold the result saturates: `next` stays the gold threshold
/// and the percentage is pinned to 100. A zero denominator counts as
/// already satisfied (100), and lower branches are clamped to 100.
pub fn tier_progress(balance: Amount, thresholds: &TierThresholds) -> TierProgress {
    if balance >= thresholds.gold {
        return TierProgress {
            current: balance,
            next: thresholds.gold,
            percentage: 100.0,
        };
    }
    let next = match classify_tier(balance, thresholds) {
        Tier::Silver | Tier::Gold => thresholds.gold,
        Tier::Bronze => thresholds.silver,
        Tier::None => thresholds.bronze,
    };
    TierProgress {
        current: balance,
        next,
        percentage: percentage_of(balance, next),
    }
}

fn percentage_of(balance: Amount, denominator: Amount) -> f64 {
    if denominator == 0 {
        return 100.0;
    }
    (balance as f64 / denominator as f64 * 100.0).min(100.0)
}

pub fn check_eligibility(balance: Amount, min_holdings: Amount) -> EligibilityCheck {
    let is_eligible = balance >= min_holdings;
    EligibilityCheck {
        is_eligible,
        current_holdings: balance,
        required_holdings: min_holdings,
        shortfall: (!is_eligible).then(|| min_holdings - balance),
    }
}

/// Base units to whole tokens, for display only.
pub fn to_display_units(amount: Amount) -> f64 {
    amount as f64 / TOKEN_DECIMALS_SCALE as f64
}
