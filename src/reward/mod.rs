//! Dynamic referral reward arithmetic.
//!
//! All ratios are basis points (`10_000` = 100%). Every step floors on its
//! own, so `compute_reward` is not the same as flooring the combined product
//! once; callers that need parity with on-chain payouts must go through it.

use serde::{Deserialize, Serialize};

use crate::ledger::Amount;

pub const BPS_DENOMINATOR: u128 = 10_000;
pub const FULL_HOLDING_RATIO_BP: u16 = 10_000;

/// Holdings multiplier brackets, checked from the largest factor down.
/// `(multiple of min holdings, multiplier in bp)`.
pub const HOLDINGS_MULTIPLIERS: [(u64, u16); 3] = [(10, 15_000), (5, 12_500), (2, 11_000)];
pub const BASE_MULTIPLIER_BP: u16 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewardError {
    #[error("{field} must be non-negative, got {value}")]
    NegativeInput { field: &'static str, value: i128 },
    #[error("{field} does not fit in {bits} bits: {value}")]
    OutOfRange {
        field: &'static str,
        value: i128,
        bits: u32,
    },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardInput {
    pub base_rate_bp: u16,
    pub referrer_holdings: Amount,
    pub purchase_amount: Amount,
    pub holding_ratio_bp: u16,
    pub min_holdings_for_referral: Amount,
}

impl RewardInput {
    pub fn compute(&self) -> Amount {
        compute_reward(
            self.base_rate_bp,
            self.referrer_holdings,
            self.purchase_amount,
            self.holding_ratio_bp,
            self.min_holdings_for_referral,
        )
    }
}

/// Signed form of [`RewardInput`] as it arrives from a transport that can
/// carry negative numbers (CLI arguments, JSON payloads).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardInputRaw {
    pub base_rate_bp: i64,
    pub referrer_holdings: i128,
    pub purchase_amount: i128,
    pub holding_ratio_bp: i64,
    pub min_holdings_for_referral: i128,
}

impl TryFrom<RewardInputRaw> for RewardInput {
    type Error = RewardError;

    fn try_from(raw: RewardInputRaw) -> Result<Self, Self::Error> {
        Ok(RewardInput {
            base_rate_bp: narrow_u16("base_rate_bp", raw.base_rate_bp.into())?,
            referrer_holdings: narrow_u64("referrer_holdings", raw.referrer_holdings)?,
            purchase_amount: narrow_u64("purchase_amount", raw.purchase_amount)?,
            holding_ratio_bp: narrow_u16("holding_ratio_bp", raw.holding_ratio_bp.into())?,
            min_holdings_for_referral: narrow_u64(
                "min_holdings_for_referral",
                raw.min_holdings_for_referral,
            )?,
        })
    }
}

pub fn non_negative(field: &'static str, value: i128) -> Result<u128, RewardError> {
    if value < 0 {
        return Err(RewardError::NegativeInput { field, value });
    }
    Ok(value as u128)
}

fn narrow_u64(field: &'static str, value: i128) -> Result<u64, RewardError> {
    let v = non_negative(field, value)?;
    u64::try_from(v).map_err(|_| RewardError::OutOfRange {
        field,
        value,
        bits: 64,
    })
}

fn narrow_u16(field: &'static str, value: i128) -> Result<u16, RewardError> {
    let v = non_negative(field, value)?;
    u16::try_from(v).map_err(|_| RewardError::OutOfRange {
        field,
        value,
        bits: 16,
    })
}

/// Step function over `referrer_holdings / min_holdings`. Ties go to the
/// higher bracket.
pub fn holdings_multiplier_bp(referrer_holdings: Amount, min_holdings: Amount) -> u16 {
    for (multiple, multiplier) in HOLDINGS_MULTIPLIERS {
        if referrer_holdings as u128 >= min_holdings as u128 * multiple as u128 {
            return multiplier;
        }
    }
    BASE_MULTIPLIER_BP
}

fn apply_bps(amount: u128, bps: u128) -> u128 {
    amount * bps / BPS_DENOMINATOR
}

pub fn compute_reward(
    base_rate_bp: u16,
    referrer_holdings: Amount,
    purchase_amount: Amount,
    holding_ratio_bp: u16,
    min_holdings_for_referral: Amount,
) -> Amount {
    let base_reward = apply_bps(purchase_amount as u128, base_rate_bp as u128);
    let holding_adjusted = apply_bps(base_reward, holding_ratio_bp as u128);
    let multiplier = holdings_multiplier_bp(referrer_holdings, min_holdings_for_referral);
    let reward = apply_bps(holding_adjusted, multiplier as u128);
    u64::try_from(reward).unwrap_or(u64::MAX)
}

/// Share of original holdings a referrer still holds, capped at 100%.
/// `None` when nothing was held at registration; the stored ratio is then
/// left as it was.
pub fn holding_ratio_bp(initial_holdings: Amount, current_holdings: Amount) -> Option<u16> {
    if initial_holdings == 0 {
        return None;
    }
    let ratio = current_holdings as u128 * BPS_DENOMINATOR / initial_holdings as u128;
    Some(ratio.min(FULL_HOLDING_RATIO_BP as u128) as u16)
}

/// Buyer-side reward for a purchase, claimable once.
pub fn purchase_reward(purchase_amount: Amount, rewards_percentage_bp: u16) -> Amount {
    let reward = apply_bps(purchase_amount as u128, rewards_percentage_bp as u128);
    u64::try_from(reward).unwrap_or(u64::MAX)
}
