use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, ParamsUpdate, ProgramConfig},
    ledger::{
        AccountId, Amount, Digest32, LedgerError, LedgerMutation, LedgerState, REWARDS_POOL,
    },
    reward::{compute_reward, holding_ratio_bp, purchase_reward, FULL_HOLDING_RATIO_BP},
    tier::{check_eligibility, classify_tier, tier_progress, EligibilityCheck, Tier, TierProgress},
    wallet::{claim_message, holdings_message, params_message, WalletAddress, WalletError},
};

pub type ReferralCode = String;

pub const MIN_REFERRAL_CODE_LEN: usize = 4;
pub const MAX_REFERRAL_CODE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("referral code must be at least {min} characters, got {0}", min = MIN_REFERRAL_CODE_LEN)]
    ReferralCodeTooShort(usize),
    #[error("referral code must be at most {max} characters, got {0}", max = MAX_REFERRAL_CODE_LEN)]
    ReferralCodeTooLong(usize),
    #[error("referral code {0} is already registered")]
    ReferralCodeTaken(ReferralCode),
    #[error("holdings {holdings} below the {required} required to become a referrer")]
    InsufficientHoldingsForReferral { holdings: Amount, required: Amount },
    #[error("unknown referral code {0}")]
    UnknownReferralCode(ReferralCode),
    #[error("wallet {wallet} does not own referral code {code}")]
    Unauthorized {
        code: ReferralCode,
        wallet: WalletAddress,
    },
    #[error("purchase amount {amount} is below the minimum {minimum}")]
    PurchaseAmountTooLow { amount: Amount, minimum: Amount },
    #[error("self-referral is not allowed")]
    SelfReferralNotAllowed,
    #[error("unknown purchase {0}")]
    UnknownPurchase(Digest32),
    #[error("rewards for purchase {0} have already been claimed")]
    RewardsAlreadyClaimed(Digest32),
    #[error("wallet {0} is not the buyer of this purchase")]
    UnauthorizedClaim(WalletAddress),
    #[error("rewards pool holds {available}, {needed} required")]
    InsufficientPoolFunds { needed: Amount, available: Amount },
    #[error("parameter update changes nothing")]
    EmptyParamsUpdate,
    #[error("wallet {0} is not the program authority")]
    NotProgramAuthority(WalletAddress),
    #[error("inconsistent program state: {0}")]
    InconsistentState(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferrerAccount {
    pub authority: WalletAddress,
    pub referral_code: ReferralCode,
    pub total_referrals: u32,
    pub total_rewards_earned: Amount,
    pub initial_holdings: Amount,
    pub current_holdings: Amount,
    pub holding_ratio_bp: u16,
    pub registered_at: i64,
    pub last_activity: i64,
}

impl ReferrerAccount {
    /// Derived on every read; no tier is stored alongside the holdings.
    pub fn tier(&self, config: &ProgramConfig) -> Tier {
        classify_tier(self.current_holdings, &config.thresholds)
    }

    pub fn is_eligible(&self, config: &ProgramConfig) -> bool {
        self.current_holdings >= config.min_holdings_for_referral
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub id: Digest32,
    pub buyer: WalletAddress,
    pub amount: Amount,
    pub timestamp: i64,
    pub referral_code: Option<ReferralCode>,
    pub referrer_reward: Amount,
    pub rewards_claimed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgramEvent {
    ProgramInitialized {
        authority: WalletAddress,
        rewards_percentage_bp: u16,
        min_purchase_amount: Amount,
        min_holdings_for_referral: Amount,
        timestamp: i64,
    },
    PoolFunded {
        amount: Amount,
        memo: Option<String>,
        timestamp: i64,
    },
    ReferrerRegistered {
        authority: WalletAddress,
        referral_code: ReferralCode,
        initial_holdings: Amount,
        timestamp: i64,
    },
    HoldingsRatioUpdated {
        authority: WalletAddress,
        referral_code: ReferralCode,
        previous_holdings: Amount,
        new_holdings: Amount,
        holding_ratio_bp: u16,
        timestamp: i64,
    },
    TierChanged {
        referral_code: ReferralCode,
        old_tier: Tier,
        new_tier: Tier,
        balance: Amount,
        timestamp: i64,
    },
    PurchaseProcessed {
        purchase_id: Digest32,
        buyer: WalletAddress,
        amount: Amount,
        timestamp: i64,
    },
    DynamicReferralProcessed {
        purchase_id: Digest32,
        buyer: WalletAddress,
        referrer: WalletAddress,
        referral_code: ReferralCode,
        purchase_amount: Amount,
        dynamic_reward: Amount,
        holding_ratio_bp: u16,
        referrer_holdings: Amount,
        timestamp: i64,
    },
    RewardsClaimed {
        purchase_id: Digest32,
        buyer: WalletAddress,
        amount: Amount,
        timestamp: i64,
    },
    ParamsUpdated {
        authority: WalletAddress,
        rewards_percentage_bp: u16,
        min_purchase_amount: Amount,
        timestamp: i64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReferralStats {
    pub total_referrals: u32,
    pub total_rewards_earned: Amount,
    pub pending_rewards: Amount,
    pub tier: Tier,
    pub token_balance: Amount,
    pub tier_progress: TierProgress,
    pub eligibility: EligibilityCheck,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub referral_code: ReferralCode,
    pub authority: WalletAddress,
    pub tier: Tier,
    pub total_referrals: u32,
    pub total_rewards_earned: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub purchase_id: Digest32,
    pub referrer_reward: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralProgram {
    authority: WalletAddress,
    config: ProgramConfig,
    referrers: BTreeMap<ReferralCode, ReferrerAccount>,
    purchases: BTreeMap<Digest32, PurchaseRecord>,
    ledger: LedgerState,
    events: Vec<ProgramEvent>,
    total_referrals: u64,
    total_rewards_distributed: Amount,
    sequence: u64,
}

impl ReferralProgram {
    /// `authority` is the only wallet allowed to change program parameters.
    pub fn new(
        config: ProgramConfig,
        authority: WalletAddress,
        now: i64,
    ) -> Result<Self, ProgramError> {
        config.validate()?;
        let mut program = Self {
            authority,
            config,
            referrers: BTreeMap::new(),
            purchases: BTreeMap::new(),
            ledger: LedgerState::new(),
            events: Vec::new(),
            total_referrals: 0,
            total_rewards_distributed: 0,
            sequence: 0,
        };
        info!(authority = %program.authority, "program initialized");
        program.emit(ProgramEvent::ProgramInitialized {
            authority: program.authority.clone(),
            rewards_percentage_bp: program.config.rewards_percentage_bp,
            min_purchase_amount: program.config.min_purchase_amount,
            min_holdings_for_referral: program.config.min_holdings_for_referral,
            timestamp: now,
        });
        Ok(program)
    }

    pub fn authority(&self) -> &WalletAddress {
        &self.authority
    }

    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    pub fn events(&self) -> &[ProgramEvent] {
        &self.events
    }

    pub fn total_referrals(&self) -> u64 {
        self.total_referrals
    }

    pub fn total_rewards_distributed(&self) -> Amount {
        self.total_rewards_distributed
    }

    pub fn referrer(&self, code: &str) -> Option<&ReferrerAccount> {
        self.referrers.get(code)
    }

    pub fn referrers(&self) -> impl Iterator<Item = &ReferrerAccount> {
        self.referrers.values()
    }

    pub fn referrers_of<'a>(
        &'a self,
        authority: &'a WalletAddress,
    ) -> impl Iterator<Item = &'a ReferrerAccount> + 'a {
        self.referrers
            .values()
            .filter(move |r| &r.authority == authority)
    }

    pub fn purchase(&self, id: &Digest32) -> Option<&PurchaseRecord> {
        self.purchases.get(id)
    }

    pub fn purchases_of<'a>(
        &'a self,
        buyer: &'a WalletAddress,
    ) -> impl Iterator<Item = &'a PurchaseRecord> + 'a {
        self.purchases.values().filter(move |p| &p.buyer == buyer)
    }

    /// Data re-read from storage is not trusted until it passes this.
    pub fn validate(&self) -> Result<(), ProgramError> {
        self.config.validate()?;
        let inconsistent = |msg: String| Err(ProgramError::InconsistentState(msg));

        for (code, account) in &self.referrers {
            if code != &account.referral_code {
                return inconsistent(format!(
                    "referrer keyed {code} carries code {}",
                    account.referral_code
                ));
            }
            check_code_len(code)?;
            if account.holding_ratio_bp > FULL_HOLDING_RATIO_BP {
                return inconsistent(format!(
                    "referrer {code} holding ratio {} bp above {FULL_HOLDING_RATIO_BP}",
                    account.holding_ratio_bp
                ));
            }
            let expected = holding_ratio_bp(account.initial_holdings, account.current_holdings)
                .unwrap_or(FULL_HOLDING_RATIO_BP);
            if account.holding_ratio_bp != expected {
                return inconsistent(format!(
                    "referrer {code} holding ratio {} bp does not match holdings {}/{} ({expected} bp)",
                    account.holding_ratio_bp, account.current_holdings, account.initial_holdings
                ));
            }
        }

        for (id, purchase) in &self.purchases {
            if id != &purchase.id {
                return inconsistent(format!("purchase keyed {id} carries id {}", purchase.id));
            }
            if let Some(code) = &purchase.referral_code {
                if !self.referrers.contains_key(code) {
                    return inconsistent(format!(
                        "purchase {id} references unknown referral code {code}"
                    ));
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self, event: ProgramEvent) {
        debug!(?event, "program event");
        self.events.push(event);
    }

    /// Receipt id for the next operation. The sequence only advances via
    /// [`Self::commit_sequence`] once that operation has succeeded.
    fn next_receipt(&self, domain: &[u8], subject: &[u8], now: i64) -> (Digest32, u64) {
        let sequence = self.sequence + 1;
        let id = Digest32::of(&[
            domain,
            subject,
            &now.to_le_bytes()[..],
            &sequence.to_le_bytes()[..],
        ]);
        (id, sequence)
    }

    fn commit_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    fn lookup(&self, code: &str) -> Result<&ReferrerAccount, ProgramError> {
        self.referrers
            .get(code)
            .ok_or_else(|| ProgramError::UnknownReferralCode(code.to_string()))
    }

    fn pay_from_pool(
        &mut self,
        to: &WalletAddress,
        amount: Amount,
        memo: String,
        receipt: Digest32,
        now: i64,
    ) -> Result<(), ProgramError> {
        let transfer = [LedgerMutation::Transfer {
            from: REWARDS_POOL.to_string(),
            to: AccountId::from(to.as_str()),
            amount,
            memo: Some(memo),
        }];
        match self.ledger.apply_mutations(&transfer, receipt, now) {
            Ok(()) => Ok(()),
            Err(LedgerError::InsufficientAccountFunds { available, .. }) => {
                Err(ProgramError::InsufficientPoolFunds {
                    needed: amount,
                    available,
                })
            }
            Err(LedgerError::UnknownAccount { .. }) => Err(ProgramError::InsufficientPoolFunds {
                needed: amount,
                available: 0,
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub fn fund_pool(
        &mut self,
        amount: Amount,
        memo: Option<String>,
        now: i64,
    ) -> Result<Digest32, ProgramError> {
        let (receipt, sequence) = self.next_receipt(b"fund", REWARDS_POOL.as_bytes(), now);
        self.ledger.apply_mutations(
            &[LedgerMutation::Emit {
                to: REWARDS_POOL.to_string(),
                amount,
                reason: memo.clone().unwrap_or_else(|| "pool funding".to_string()),
            }],
            receipt,
            now,
        )?;
        self.commit_sequence(sequence);
        info!(amount, pool = self.ledger.pool_balance(), "rewards pool funded");
        self.emit(ProgramEvent::PoolFunded {
            amount,
            memo,
            timestamp: now,
        });
        Ok(receipt)
    }

    pub fn register_referrer(
        &mut self,
        authority: WalletAddress,
        referral_code: ReferralCode,
        holdings: Amount,
        now: i64,
    ) -> Result<&ReferrerAccount, ProgramError> {
        check_code_len(&referral_code)?;
        if self.referrers.contains_key(&referral_code) {
            return Err(ProgramError::ReferralCodeTaken(referral_code));
        }
        let eligibility = check_eligibility(holdings, self.config.min_holdings_for_referral);
        if !eligibility.is_eligible {
            return Err(ProgramError::InsufficientHoldingsForReferral {
                holdings,
                required: eligibility.required_holdings,
            });
        }

        let account = ReferrerAccount {
            authority: authority.clone(),
            referral_code: referral_code.clone(),
            total_referrals: 0,
            total_rewards_earned: 0,
            initial_holdings: holdings,
            current_holdings: holdings,
            holding_ratio_bp: FULL_HOLDING_RATIO_BP,
            registered_at: now,
            last_activity: now,
        };
        info!(
            code = %referral_code,
            %authority,
            holdings,
            tier = %account.tier(&self.config),
            "referrer registered"
        );
        self.referrers.insert(referral_code.clone(), account);
        self.emit(ProgramEvent::ReferrerRegistered {
            authority,
            referral_code: referral_code.clone(),
            initial_holdings: holdings,
            timestamp: now,
        });
        self.lookup(&referral_code)
    }

    /// Records a new balance for a referrer, authorized by the referrer's
    /// signature over [`holdings_message`]. The holding ratio follows the
    /// balance relative to registration; the tier is re-derived.
    pub fn update_holdings_signed(
        &mut self,
        code: &str,
        authority: &WalletAddress,
        holdings: Amount,
        signature_b64: &str,
        now: i64,
    ) -> Result<&ReferrerAccount, ProgramError> {
        authority.verify(&holdings_message(code, holdings, now), signature_b64)?;
        self.update_holdings(code, authority, holdings, now)
    }

    fn update_holdings(
        &mut self,
        code: &str,
        authority: &WalletAddress,
        holdings: Amount,
        now: i64,
    ) -> Result<&ReferrerAccount, ProgramError> {
        let config = self.config.clone();
        let account = self
            .referrers
            .get_mut(code)
            .ok_or_else(|| ProgramError::UnknownReferralCode(code.to_string()))?;
        if &account.authority != authority {
            return Err(ProgramError::Unauthorized {
                code: code.to_string(),
                wallet: authority.clone(),
            });
        }

        let old_tier = account.tier(&config);
        let previous_holdings = account.current_holdings;
        account.current_holdings = holdings;
        if let Some(ratio) = holding_ratio_bp(account.initial_holdings, holdings) {
            account.holding_ratio_bp = ratio;
        }
        account.last_activity = now;
        let new_tier = account.tier(&config);
        let ratio = account.holding_ratio_bp;
        let authority = account.authority.clone();

        if holdings < previous_holdings {
            warn!(code, previous_holdings, holdings, ratio, "referrer holdings decreased");
        }
        self.emit(ProgramEvent::HoldingsRatioUpdated {
            authority,
            referral_code: code.to_string(),
            previous_holdings,
            new_holdings: holdings,
            holding_ratio_bp: ratio,
            timestamp: now,
        });
        if old_tier != new_tier {
            info!(code, %old_tier, %new_tier, "tier changed");
            self.emit(ProgramEvent::TierChanged {
                referral_code: code.to_string(),
                old_tier,
                new_tier,
                balance: holdings,
                timestamp: now,
            });
        }
        self.lookup(code)
    }

    pub fn tier_of(&self, code: &str) -> Result<Tier, ProgramError> {
        Ok(self.lookup(code)?.tier(&self.config))
    }

    pub fn process_purchase(
        &mut self,
        buyer: WalletAddress,
        amount: Amount,
        referral_code: Option<&str>,
        now: i64,
    ) -> Result<PurchaseOutcome, ProgramError> {
        if amount < self.config.min_purchase_amount {
            return Err(ProgramError::PurchaseAmountTooLow {
                amount,
                minimum: self.config.min_purchase_amount,
            });
        }

        let referral = match referral_code {
            Some(code) => {
                let referrer = self.lookup(code)?;
                if referrer.authority == buyer {
                    return Err(ProgramError::SelfReferralNotAllowed);
                }
                let reward = compute_reward(
                    self.config.base_reward_rate_bp,
                    referrer.current_holdings,
                    amount,
                    referrer.holding_ratio_bp,
                    self.config.min_holdings_for_referral,
                );
                Some((referrer.clone(), reward))
            }
            None => None,
        };

        let (purchase_id, sequence) =
            self.next_receipt(b"purchase", buyer.as_str().as_bytes(), now);
        let mut referrer_reward = 0;
        if let Some((referrer, reward)) = &referral {
            if *reward > 0 {
                self.pay_from_pool(
                    &referrer.authority,
                    *reward,
                    format!("referral {} purchase {}", referrer.referral_code, purchase_id),
                    purchase_id,
                    now,
                )?;
            }
            referrer_reward = *reward;
        }
        self.commit_sequence(sequence);

        self.purchases.insert(
            purchase_id,
            PurchaseRecord {
                id: purchase_id,
                buyer: buyer.clone(),
                amount,
                timestamp: now,
                referral_code: referral.as_ref().map(|(r, _)| r.referral_code.clone()),
                referrer_reward,
                rewards_claimed: false,
            },
        );

        if let Some((snapshot, reward)) = referral {
            if let Some(account) = self.referrers.get_mut(&snapshot.referral_code) {
                account.total_referrals = account.total_referrals.saturating_add(1);
                account.total_rewards_earned = account.total_rewards_earned.saturating_add(reward);
                account.last_activity = now;
            }
            self.total_referrals += 1;
            self.total_rewards_distributed = self.total_rewards_distributed.saturating_add(reward);
            info!(
                purchase = %purchase_id,
                code = %snapshot.referral_code,
                amount,
                reward,
                ratio = snapshot.holding_ratio_bp,
                "referral reward paid"
            );
            self.emit(ProgramEvent::DynamicReferralProcessed {
                purchase_id,
                buyer: buyer.clone(),
                referrer: snapshot.authority,
                referral_code: snapshot.referral_code,
                purchase_amount: amount,
                dynamic_reward: reward,
                holding_ratio_bp: snapshot.holding_ratio_bp,
                referrer_holdings: snapshot.current_holdings,
                timestamp: now,
            });
        }

        info!(purchase = %purchase_id, %buyer, amount, "purchase processed");
        self.emit(ProgramEvent::PurchaseProcessed {
            purchase_id,
            buyer,
            amount,
            timestamp: now,
        });
        Ok(PurchaseOutcome {
            purchase_id,
            referrer_reward,
        })
    }

    /// Pays the buyer side reward of a purchase, once.
    fn claim_rewards(
        &mut self,
        purchase_id: &Digest32,
        claimant: &WalletAddress,
        now: i64,
    ) -> Result<Amount, ProgramError> {
        let purchase = self
            .purchases
            .get(purchase_id)
            .ok_or(ProgramError::UnknownPurchase(*purchase_id))?;
        if purchase.rewards_claimed {
            return Err(ProgramError::RewardsAlreadyClaimed(*purchase_id));
        }
        if &purchase.buyer != claimant {
            return Err(ProgramError::UnauthorizedClaim(claimant.clone()));
        }

        let amount = purchase_reward(purchase.amount, self.config.rewards_percentage_bp);
        if amount > 0 {
            let receipt = Digest32::of(&[b"claim".as_slice(), purchase_id.0.as_slice()]);
            self.pay_from_pool(
                claimant,
                amount,
                format!("claim {purchase_id}"),
                receipt,
                now,
            )?;
        }
        if let Some(purchase) = self.purchases.get_mut(purchase_id) {
            purchase.rewards_claimed = true;
        }
        info!(purchase = %purchase_id, buyer = %claimant, amount, "rewards claimed");
        self.emit(ProgramEvent::RewardsClaimed {
            purchase_id: *purchase_id,
            buyer: claimant.clone(),
            amount,
            timestamp: now,
        });
        Ok(amount)
    }

    /// [`Self::claim_rewards`] gated on a wallet signature over the claim
    /// message for `purchase_id`.
    pub fn claim_rewards_signed(
        &mut self,
        purchase_id: &Digest32,
        claimant: &WalletAddress,
        signature_b64: &str,
        now: i64,
    ) -> Result<Amount, ProgramError> {
        claimant.verify(&claim_message(purchase_id), signature_b64)?;
        self.claim_rewards(purchase_id, claimant, now)
    }

    /// Parameter change signed by the program authority over
    /// [`params_message`].
    pub fn update_params_signed(
        &mut self,
        update: &ParamsUpdate,
        signer: &WalletAddress,
        signature_b64: &str,
        now: i64,
    ) -> Result<(), ProgramError> {
        if signer != &self.authority {
            return Err(ProgramError::NotProgramAuthority(signer.clone()));
        }
        signer.verify(&params_message(update, now), signature_b64)?;
        self.update_params(update, now)
    }

    fn update_params(&mut self, update: &ParamsUpdate, now: i64) -> Result<(), ProgramError> {
        if update.is_empty() {
            return Err(ProgramError::EmptyParamsUpdate);
        }
        let before: BTreeMap<ReferralCode, Tier> = self
            .referrers
            .iter()
            .map(|(code, r)| (code.clone(), r.tier(&self.config)))
            .collect();

        self.config.apply(update)?;
        info!(
            rewards_percentage_bp = self.config.rewards_percentage_bp,
            min_purchase_amount = self.config.min_purchase_amount,
            thresholds = ?self.config.thresholds,
            "program params updated"
        );
        self.emit(ProgramEvent::ParamsUpdated {
            authority: self.authority.clone(),
            rewards_percentage_bp: self.config.rewards_percentage_bp,
            min_purchase_amount: self.config.min_purchase_amount,
            timestamp: now,
        });

        let moved: Vec<ProgramEvent> = self
            .referrers
            .iter()
            .filter_map(|(code, r)| {
                let old_tier = before.get(code).copied().unwrap_or_default();
                let new_tier = r.tier(&self.config);
                (old_tier != new_tier).then(|| ProgramEvent::TierChanged {
                    referral_code: code.clone(),
                    old_tier,
                    new_tier,
                    balance: r.current_holdings,
                    timestamp: now,
                })
            })
            .collect();
        for event in moved {
            self.emit(event);
        }
        Ok(())
    }

    pub fn eligibility(&self, holdings: Amount) -> EligibilityCheck {
        check_eligibility(holdings, self.config.min_holdings_for_referral)
    }

    /// Unclaimed buyer rewards for `buyer` at the current rewards percentage.
    pub fn pending_rewards(&self, buyer: &WalletAddress) -> Amount {
        self.purchases_of(buyer)
            .filter(|p| !p.rewards_claimed)
            .map(|p| purchase_reward(p.amount, self.config.rewards_percentage_bp))
            .fold(0, Amount::saturating_add)
    }

    pub fn stats(&self, code: &str) -> Result<ReferralStats, ProgramError> {
        let referrer = self.lookup(code)?;
        let balance = referrer.current_holdings;
        Ok(ReferralStats {
            total_referrals: referrer.total_referrals,
            total_rewards_earned: referrer.total_rewards_earned,
            pending_rewards: self.pending_rewards(&referrer.authority),
            tier: referrer.tier(&self.config),
            token_balance: balance,
            tier_progress: tier_progress(balance, &self.config.thresholds),
            eligibility: self.eligibility(balance),
        })
    }

    /// Still-eligible referrers by rewards earned, highest first.
    pub fn leaderboard(&self, limit: usize) -> Vec<LeaderboardEntry> {
        let mut ranked: Vec<&ReferrerAccount> = self
            .referrers
            .values()
            .filter(|r| r.is_eligible(&self.config))
            .collect();
        ranked.sort_by(|a, b| {
            b.total_rewards_earned
                .cmp(&a.total_rewards_earned)
                .then_with(|| a.referral_code.cmp(&b.referral_code))
        });
        ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(idx, r)| LeaderboardEntry {
                rank: idx + 1,
                referral_code: r.referral_code.clone(),
                authority: r.authority.clone(),
                tier: r.tier(&self.config),
                total_referrals: r.total_referrals,
                total_rewards_earned: r.total_rewards_earned,
            })
            .collect()
    }
}

/// Length in bytes, as stored on chain.
fn check_code_len(code: &str) -> Result<(), ProgramError> {
    let len = code.len();
    if len < MIN_REFERRAL_CODE_LEN {
        return Err(ProgramError::ReferralCodeTooShort(len));
    }
    if len > MAX_REFERRAL_CODE_LEN {
        return Err(ProgramError::ReferralCodeTooLong(len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use ed25519_dalek::SigningKey;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::wallet::sign_message;

    const MIN: Amount = 1_000_000;

    fn wallet(seed: u64) -> (SigningKey, WalletAddress) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sk = SigningKey::generate(&mut rng);
        let address = WalletAddress::from_verifying_key(&sk.verifying_key());
        (sk, address)
    }

    const ADMIN_SEED: u64 = 100;

    fn new_program() -> ReferralProgram {
        ReferralProgram::new(ProgramConfig::default(), wallet(ADMIN_SEED).1, 0).unwrap()
    }

    fn funded_program() -> ReferralProgram {
        let mut program = new_program();
        program.fund_pool(100_000_000, None, 1).unwrap();
        program
    }

    #[test]
    fn registration_enforces_code_length_and_holdings() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        assert!(matches!(
            program.register_referrer(alice.clone(), "abc".into(), MIN, 2),
            Err(ProgramError::ReferralCodeTooShort(3))
        ));
        assert!(matches!(
            program.register_referrer(alice.clone(), "x".repeat(33), MIN, 2),
            Err(ProgramError::ReferralCodeTooLong(33))
        ));
        assert!(matches!(
            program.register_referrer(alice.clone(), "ALICE".into(), MIN - 1, 2),
            Err(ProgramError::InsufficientHoldingsForReferral { .. })
        ));
        let account = program
            .register_referrer(alice.clone(), "ALICE".into(), MIN, 2)
            .unwrap();
        assert_eq!(account.holding_ratio_bp, 10_000);
        assert_eq!(account.tier(&ProgramConfig::default()), Tier::Bronze);
        assert!(matches!(
            program.register_referrer(alice, "ALICE".into(), MIN, 3),
            Err(ProgramError::ReferralCodeTaken(_))
        ));
    }

    #[test]
    fn purchase_pays_dynamic_reward_to_referrer() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        let (_, bob) = wallet(2);
        program
            .register_referrer(alice.clone(), "ALICE".into(), 2 * MIN, 2)
            .unwrap();

        let outcome = program
            .process_purchase(bob.clone(), 1_000_000, Some("ALICE"), 3)
            .unwrap();
        assert_eq!(outcome.referrer_reward, 55_000);
        assert_eq!(program.ledger().balance_of(alice.as_str()), 55_000);
        assert_eq!(program.ledger().pool_balance(), 100_000_000 - 55_000);

        let account = program.referrer("ALICE").unwrap();
        assert_eq!(account.total_referrals, 1);
        assert_eq!(account.total_rewards_earned, 55_000);
        assert_eq!(program.total_referrals(), 1);
        assert_eq!(program.total_rewards_distributed(), 55_000);
        assert!(matches!(
            program.events().last(),
            Some(ProgramEvent::PurchaseProcessed { amount: 1_000_000, .. })
        ));
    }

    #[test]
    fn purchase_rejections() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        program
            .register_referrer(alice.clone(), "ALICE".into(), MIN, 2)
            .unwrap();
        assert!(matches!(
            program.process_purchase(alice.clone(), 10, Some("ALICE"), 3),
            Err(ProgramError::SelfReferralNotAllowed)
        ));
        assert!(matches!(
            program.process_purchase(alice.clone(), 10, Some("NOPE"), 3),
            Err(ProgramError::UnknownReferralCode(_))
        ));
        assert!(matches!(
            program.process_purchase(alice, 0, None, 3),
            Err(ProgramError::PurchaseAmountTooLow { minimum: 1, .. })
        ));
    }

    #[test]
    fn empty_pool_aborts_purchase_without_side_effects() {
        let mut program = new_program();
        let (_, alice) = wallet(1);
        let (_, bob) = wallet(2);
        program
            .register_referrer(alice, "ALICE".into(), MIN, 1)
            .unwrap();
        let before = program.clone();
        let err = program
            .process_purchase(bob, 1_000_000, Some("ALICE"), 2)
            .unwrap_err();
        assert!(matches!(
            err,
            ProgramError::InsufficientPoolFunds {
                needed: 50_000,
                available: 0
            }
        ));
        assert_eq!(program, before);
    }

    #[test]
    fn selling_down_penalises_future_rewards() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        let (_, bob) = wallet(2);
        program
            .register_referrer(alice.clone(), "ALICE".into(), 4 * MIN, 2)
            .unwrap();
        let account = program
            .update_holdings("ALICE", &alice, 2 * MIN, 3)
            .unwrap();
        assert_eq!(account.holding_ratio_bp, 5_000);

        // 2x minimum -> 1.1x, half ratio: 50_000 -> 25_000 -> 27_500
        let outcome = program
            .process_purchase(bob, 1_000_000, Some("ALICE"), 4)
            .unwrap();
        assert_eq!(outcome.referrer_reward, 27_500);

        let account = program
            .update_holdings("ALICE", &alice, 12 * MIN, 5)
            .unwrap();
        assert_eq!(account.holding_ratio_bp, 10_000);
    }

    #[test]
    fn holdings_updates_require_the_owner_and_track_tier() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        let (_, mallory) = wallet(3);
        program
            .register_referrer(alice.clone(), "ALICE".into(), MIN, 2)
            .unwrap();
        assert!(matches!(
            program.update_holdings("ALICE", &mallory, 0, 3),
            Err(ProgramError::Unauthorized { .. })
        ));

        program
            .update_holdings("ALICE", &alice, 10 * MIN, 3)
            .unwrap();
        assert_eq!(program.tier_of("ALICE").unwrap(), Tier::Gold);
        assert!(program.events().iter().any(|e| matches!(
            e,
            ProgramEvent::TierChanged {
                old_tier: Tier::Bronze,
                new_tier: Tier::Gold,
                ..
            }
        )));
    }

    #[test]
    fn claims_pay_once_and_only_to_the_buyer() {
        let mut program = funded_program();
        let (bob_key, bob) = wallet(2);
        let (carol_key, carol) = wallet(3);
        let outcome = program.process_purchase(bob.clone(), 1_000_000, None, 2).unwrap();
        let id = outcome.purchase_id;

        let forged = sign_message(&carol_key, &claim_message(&id));
        assert!(matches!(
            program.claim_rewards_signed(&id, &carol, &forged, 3),
            Err(ProgramError::UnauthorizedClaim(_))
        ));
        assert!(matches!(
            program.claim_rewards_signed(&id, &bob, &forged, 3),
            Err(ProgramError::Wallet(WalletError::InvalidSignature(_)))
        ));

        assert_eq!(program.pending_rewards(&bob), 20_000);
        let signature = sign_message(&bob_key, &claim_message(&id));
        let paid = program.claim_rewards_signed(&id, &bob, &signature, 3).unwrap();
        assert_eq!(paid, 20_000);
        assert_eq!(program.ledger().balance_of(bob.as_str()), 20_000);
        assert_eq!(program.pending_rewards(&bob), 0);
        assert!(matches!(
            program.claim_rewards(&id, &bob, 4),
            Err(ProgramError::RewardsAlreadyClaimed(_))
        ));
        assert!(matches!(
            program.claim_rewards(&Digest32([7; 32]), &bob, 4),
            Err(ProgramError::UnknownPurchase(_))
        ));
    }

    #[test]
    fn invalid_params_update_is_rejected_whole() {
        let mut program = funded_program();
        let before = program.config().clone();
        let err = program
            .update_params(
                &ParamsUpdate {
                    rewards_percentage_bp: Some(5_000),
                    ..Default::default()
                },
                2,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ProgramError::Config(ConfigError::InvalidRewardsPercentage(5_000))
        ));
        assert_eq!(program.config(), &before);
        assert!(matches!(
            program.update_params(&ParamsUpdate::default(), 2),
            Err(ProgramError::EmptyParamsUpdate)
        ));
    }

    #[test]
    fn threshold_change_rederives_tiers() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        program
            .register_referrer(alice, "ALICE".into(), 3 * MIN, 2)
            .unwrap();
        assert_eq!(program.tier_of("ALICE").unwrap(), Tier::Bronze);
        program
            .update_params(
                &ParamsUpdate {
                    tier_thresholds: Some([MIN, 2 * MIN, 3 * MIN]),
                    ..Default::default()
                },
                3,
            )
            .unwrap();
        assert_eq!(program.tier_of("ALICE").unwrap(), Tier::Gold);
        assert!(matches!(
            program.events().last(),
            Some(ProgramEvent::TierChanged {
                new_tier: Tier::Gold,
                ..
            })
        ));
    }

    #[test]
    fn stats_and_leaderboard() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        let (_, bob) = wallet(2);
        let (_, carol) = wallet(3);
        program
            .register_referrer(alice.clone(), "ALICE".into(), 6 * MIN, 2)
            .unwrap();
        program
            .register_referrer(bob.clone(), "BOBB".into(), MIN, 2)
            .unwrap();
        program
            .register_referrer(carol.clone(), "CAROL".into(), MIN, 2)
            .unwrap();
        program
            .process_purchase(carol.clone(), 2_000_000, Some("ALICE"), 3)
            .unwrap();
        program
            .process_purchase(carol.clone(), 1_000_000, Some("BOBB"), 4)
            .unwrap();
        program
            .process_purchase(alice.clone(), 500_000, None, 5)
            .unwrap();
        // carol drops below the minimum and leaves the board
        program.update_holdings("CAROL", &carol, 0, 6).unwrap();

        let stats = program.stats("ALICE").unwrap();
        assert_eq!(stats.total_referrals, 1);
        // 2_000_000 * 5% = 100_000, 5x -> 1.25x
        assert_eq!(stats.total_rewards_earned, 125_000);
        assert_eq!(stats.pending_rewards, 10_000);
        assert_eq!(stats.tier, Tier::Silver);
        assert_eq!(stats.tier_progress.next, 10 * MIN);
        assert!((stats.tier_progress.percentage - 60.0).abs() < 1e-9);
        assert!(stats.eligibility.is_eligible);

        let board = program.leaderboard(10);
        let codes: Vec<&str> = board.iter().map(|e| e.referral_code.as_str()).collect();
        assert_eq!(codes, vec!["ALICE", "BOBB"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].total_rewards_earned, 50_000);
        assert_eq!(program.leaderboard(1).len(), 1);
    }

    #[test]
    fn code_length_counts_bytes() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        // 11 two-byte characters: 22 bytes passes, 17 of them is 34 bytes
        assert!(program
            .register_referrer(alice.clone(), "é".repeat(11), MIN, 2)
            .is_ok());
        assert!(matches!(
            program.register_referrer(alice, "é".repeat(17), MIN, 2),
            Err(ProgramError::ReferralCodeTooLong(34))
        ));
    }

    #[test]
    fn holdings_update_needs_the_referrer_signature() {
        let mut program = funded_program();
        let (alice_key, alice) = wallet(1);
        let (mallory_key, _) = wallet(3);
        program
            .register_referrer(alice.clone(), "ALICE".into(), MIN, 2)
            .unwrap();

        let forged = sign_message(&mallory_key, &holdings_message("ALICE", 50 * MIN, 4));
        assert!(matches!(
            program.update_holdings_signed("ALICE", &alice, 50 * MIN, &forged, 4),
            Err(ProgramError::Wallet(WalletError::InvalidSignature(_)))
        ));
        assert_eq!(program.referrer("ALICE").unwrap().current_holdings, MIN);

        // a signature for one balance does not authorize another
        let signed = sign_message(&alice_key, &holdings_message("ALICE", 3 * MIN, 4));
        assert!(program
            .update_holdings_signed("ALICE", &alice, 50 * MIN, &signed, 4)
            .is_err());
        let account = program
            .update_holdings_signed("ALICE", &alice, 3 * MIN, &signed, 4)
            .unwrap();
        assert_eq!(account.current_holdings, 3 * MIN);
    }

    #[test]
    fn params_update_needs_the_program_authority() {
        let mut program = funded_program();
        let (admin_key, admin) = wallet(ADMIN_SEED);
        let (outsider_key, outsider) = wallet(3);
        let update = ParamsUpdate {
            rewards_percentage_bp: Some(500),
            ..Default::default()
        };
        assert_eq!(program.authority(), &admin);

        let signature = sign_message(&outsider_key, &params_message(&update, 5));
        assert!(matches!(
            program.update_params_signed(&update, &outsider, &signature, 5),
            Err(ProgramError::NotProgramAuthority(_))
        ));
        assert!(matches!(
            program.update_params_signed(&update, &admin, &signature, 5),
            Err(ProgramError::Wallet(WalletError::InvalidSignature(_)))
        ));
        assert_eq!(program.config().rewards_percentage_bp, 200);

        let signature = sign_message(&admin_key, &params_message(&update, 5));
        program
            .update_params_signed(&update, &admin, &signature, 5)
            .unwrap();
        assert_eq!(program.config().rewards_percentage_bp, 500);
        assert!(matches!(
            program.events().first(),
            Some(ProgramEvent::ProgramInitialized { authority, .. }) if authority == &admin
        ));
    }

    #[test]
    fn validate_rejects_tampered_referrers_and_purchases() {
        let mut program = funded_program();
        let (_, alice) = wallet(1);
        let (_, bob) = wallet(2);
        program
            .register_referrer(alice, "ALICE".into(), 2 * MIN, 2)
            .unwrap();
        let outcome = program
            .process_purchase(bob, 1_000_000, Some("ALICE"), 3)
            .unwrap();
        program.validate().unwrap();

        let mut inflated = program.clone();
        inflated.referrers.get_mut("ALICE").unwrap().holding_ratio_bp = 60_000;
        assert!(matches!(
            inflated.validate(),
            Err(ProgramError::InconsistentState(_))
        ));

        let mut stale_ratio = program.clone();
        stale_ratio.referrers.get_mut("ALICE").unwrap().current_holdings = MIN;
        assert!(stale_ratio.validate().is_err());

        let mut rekeyed = program.clone();
        let account = rekeyed.referrers.remove("ALICE").unwrap();
        rekeyed.referrers.insert("MALLORY".into(), account);
        assert!(rekeyed.validate().is_err());

        let mut moved_purchase = program.clone();
        let record = moved_purchase
            .purchases
            .remove(&outcome.purchase_id)
            .unwrap();
        moved_purchase.purchases.insert(Digest32([1; 32]), record);
        assert!(matches!(
            moved_purchase.validate(),
            Err(ProgramError::InconsistentState(_))
        ));
    }
}
