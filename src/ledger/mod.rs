use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

pub type AccountId = String;
pub type Amount = u64;

pub const REWARDS_POOL: &str = "rewards_pool";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds in account {account}: need {needed}, have {available}")]
    InsufficientAccountFunds {
        account: AccountId,
        needed: Amount,
        available: Amount,
    },
    #[error("unknown account {account}")]
    UnknownAccount { account: AccountId },
    #[error("balance overflow in account {account}")]
    Overflow { account: AccountId },
    #[error("duplicate receipt {0}")]
    DuplicateReceipt(Digest32),
}

/// SHA-256 output, hex encoded in JSON.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub fn of(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Digest32(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut out)?;
        Ok(Digest32(out))
    }
}

impl fmt::Display for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest32({})", self.to_hex())
    }
}

impl Serialize for Digest32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Digest32::from_hex(&encoded).map_err(D::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountBalance {
    pub available: Amount,
    pub total_received: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: i64,
    pub previous_receipt: Option<Digest32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, AccountBalance>,
    pub state_root: Digest32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    Emit {
        to: AccountId,
        amount: Amount,
        reason: String,
    },
    Transfer {
        from: AccountId,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEntry {
    Emission {
        receipt: Digest32,
        to: AccountId,
        amount: Amount,
        reason: String,
    },
    Transfer {
        receipt: Digest32,
        from: AccountId,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, AccountBalance>,
    pub entries: Vec<LedgerEntry>,
    applied_receipts: BTreeSet<Digest32>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &str) -> Amount {
        self.accounts.get(account).map_or(0, |b| b.available)
    }

    pub fn pool_balance(&self) -> Amount {
        self.balance_of(REWARDS_POOL)
    }

    pub fn has_receipt(&self, receipt_id: &Digest32) -> bool {
        self.applied_receipts.contains(receipt_id)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            accounts: self.accounts.clone(),
            state_root: compute_state_root(&self.accounts),
        }
    }

    /// Checks that `mutations` would apply cleanly without touching state.
    pub fn check_mutations(&self, mutations: &[LedgerMutation]) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.clone();
        for mutation in mutations {
            stage(&mut accounts, mutation)?;
        }
        Ok(())
    }

    /// Applies every mutation or none of them.
    pub fn apply_mutations(
        &mut self,
        mutations: &[LedgerMutation],
        receipt_id: Digest32,
        timestamp: i64,
    ) -> Result<(), LedgerError> {
        if self.applied_receipts.contains(&receipt_id) {
            return Err(LedgerError::DuplicateReceipt(receipt_id));
        }

        let mut accounts = self.accounts.clone();
        let mut entries = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            stage(&mut accounts, mutation)?;
            entries.push(match mutation {
                LedgerMutation::Emit { to, amount, reason } => LedgerEntry::Emission {
                    receipt: receipt_id,
                    to: to.clone(),
                    amount: *amount,
                    reason: reason.clone(),
                },
                LedgerMutation::Transfer {
                    from,
                    to,
                    amount,
                    memo,
                } => LedgerEntry::Transfer {
                    receipt: receipt_id,
                    from: from.clone(),
                    to: to.clone(),
                    amount: *amount,
                    memo: memo.clone(),
                },
            });
        }

        self.accounts = accounts;
        self.entries.extend(entries);
        self.meta.height += 1;
        self.meta.timestamp = timestamp;
        self.meta.previous_receipt = Some(receipt_id);
        self.applied_receipts.insert(receipt_id);
        Ok(())
    }
}

fn credit(
    accounts: &mut BTreeMap<AccountId, AccountBalance>,
    account: &AccountId,
    amount: Amount,
) -> Result<(), LedgerError> {
    let balance = accounts.entry(account.clone()).or_default();
    let overflow = || LedgerError::Overflow {
        account: account.clone(),
    };
    balance.available = balance.available.checked_add(amount).ok_or_else(overflow)?;
    balance.total_received = balance.total_received.saturating_add(amount);
    Ok(())
}

fn debit(
    accounts: &mut BTreeMap<AccountId, AccountBalance>,
    account: &AccountId,
    amount: Amount,
) -> Result<(), LedgerError> {
    let balance = accounts
        .get_mut(account)
        .ok_or_else(|| LedgerError::UnknownAccount {
            account: account.clone(),
        })?;
    if balance.available < amount {
        return Err(LedgerError::InsufficientAccountFunds {
            account: account.clone(),
            needed: amount,
            available: balance.available,
        });
    }
    balance.available -= amount;
    Ok(())
}

fn stage(
    accounts: &mut BTreeMap<AccountId, AccountBalance>,
    mutation: &LedgerMutation,
) -> Result<(), LedgerError> {
    match mutation {
        LedgerMutation::Emit { to, amount, .. } => credit(accounts, to, *amount),
        LedgerMutation::Transfer {
            from, to, amount, ..
        } => {
            debit(accounts, from, *amount)?;
            credit(accounts, to, *amount)
        }
    }
}

fn compute_state_root(accounts: &BTreeMap<AccountId, AccountBalance>) -> Digest32 {
    let leaves: Vec<[u8; 32]> = accounts
        .iter()
        .map(|(account, balance)| {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update(account.as_bytes());
            hasher.update(balance.available.to_le_bytes());
            hasher.update(balance.total_received.to_le_bytes());
            hasher.finalize().into()
        })
        .collect();
    Digest32(build_merkle(leaves))
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"otto-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            // odd node pairs with itself
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
