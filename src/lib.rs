//! Referral rewards engine for the OTTO token.
//!
//! The pure core decides tiers and rewards from a balance snapshot:
//!
//! * [`tier`]: tier classification, progress towards the next tier and
//!   referral eligibility.
//! * [`reward`]: the dynamic referral reward (base rate, holding ratio
//!   penalty, holdings multiplier) in floor-per-step basis-point arithmetic.
//!
//! Around it sits the bookkeeping that replaces mocked reward data:
//!
//! * [`config`]: validated program parameters.
//! * [`ledger`]: rewards pool and wallet balances with a SHA-256 state root.
//! * [`program`]: referrer registration, purchases, claims, stats.
//! * [`wallet`]: ed25519 wallet addresses and signed authorizations.
//! * [`store`]: persistence of program state between runs.

pub mod config;
pub mod ledger;
pub mod program;
pub mod reward;
pub mod store;
pub mod tier;
pub mod wallet;

pub use config::{ConfigError, ParamsUpdate, ProgramConfig};
pub use program::{ProgramError, ReferralProgram};
pub use reward::{compute_reward, RewardError, RewardInput};
pub use tier::{classify_tier, tier_progress, Tier, TierError, TierProgress, TierThresholds};
