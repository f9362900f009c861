use std::{fmt, str::FromStr};

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    config::ParamsUpdate,
    ledger::{Amount, Digest32},
};

const REFERRAL_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const GENERATED_CODE_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("invalid wallet address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature does not verify for wallet {0}")]
    InvalidSignature(WalletAddress),
}

/// An ed25519 public key, hex encoded.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(address: &str) -> Result<Self, WalletError> {
        let address = address.trim();
        let invalid = |reason: String| WalletError::InvalidAddress {
            address: address.to_string(),
            reason,
        };
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(address, &mut bytes).map_err(|e| invalid(e.to_string()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;
        Ok(WalletAddress(address.to_ascii_lowercase()))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        WalletAddress(hex::encode(key.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn verifying_key(&self) -> Result<VerifyingKey, WalletError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&self.0, &mut bytes).map_err(|e| WalletError::InvalidAddress {
            address: self.0.clone(),
            reason: e.to_string(),
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| WalletError::InvalidAddress {
            address: self.0.clone(),
            reason: e.to_string(),
        })
    }

    pub fn verify(&self, message: &[u8], signature_b64: &str) -> Result<(), WalletError> {
        let raw = general_purpose::STANDARD
            .decode(signature_b64.trim())
            .map_err(|e| WalletError::MalformedSignature(e.to_string()))?;
        let signature =
            Signature::from_slice(&raw).map_err(|e| WalletError::MalformedSignature(e.to_string()))?;
        self.verifying_key()?
            .verify_strict(message, &signature)
            .map_err(|_| WalletError::InvalidSignature(self.clone()))
    }
}

impl FromStr for WalletAddress {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WalletAddress::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = WalletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        WalletAddress::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletAddress({})", self.0)
    }
}

/// Proof that the holder of `address` controls its key at `timestamp`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletConnection {
    pub address: WalletAddress,
    pub signature: String,
    pub timestamp: i64,
}

pub fn connection_message(address: &WalletAddress, timestamp: i64) -> Vec<u8> {
    format!("otto-rewards:connect:{address}:{timestamp}").into_bytes()
}

pub fn claim_message(purchase_id: &Digest32) -> Vec<u8> {
    format!("otto-rewards:claim:{purchase_id}").into_bytes()
}

/// Signed by a referrer's authority to record a new balance.
pub fn holdings_message(code: &str, holdings: Amount, timestamp: i64) -> Vec<u8> {
    format!("otto-rewards:holdings:{code}:{holdings}:{timestamp}").into_bytes()
}

/// Signed by the program authority. Unset fields render as `-`.
pub fn params_message(update: &ParamsUpdate, timestamp: i64) -> Vec<u8> {
    let field = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    format!(
        "otto-rewards:params:{}:{}:{}:{timestamp}",
        field(update.rewards_percentage_bp.map(|v| v.to_string())),
        field(update.min_purchase_amount.map(|v| v.to_string())),
        field(
            update
                .tier_thresholds
                .map(|[b, s, g]| format!("{b},{s},{g}"))
        ),
    )
    .into_bytes()
}

pub fn verify_wallet_connection(connection: &WalletConnection) -> Result<(), WalletError> {
    let message = connection_message(&connection.address, connection.timestamp);
    connection.address.verify(&message, &connection.signature)
}

pub fn sign_message(key: &SigningKey, message: &[u8]) -> String {
    general_purpose::STANDARD.encode(key.sign(message).to_bytes())
}

pub fn generate_referral_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..GENERATED_CODE_LEN)
        .map(|_| REFERRAL_CODE_ALPHABET[rng.gen_range(0..REFERRAL_CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{rngs::StdRng, SeedableRng};

    fn keypair(seed: u64) -> (SigningKey, WalletAddress) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sk = SigningKey::generate(&mut rng);
        let address = WalletAddress::from_verifying_key(&sk.verifying_key());
        (sk, address)
    }

    #[test]
    fn parses_hex_keys_and_rejects_garbage() {
        let (_, address) = keypair(1);
        let upper = address.as_str().to_ascii_uppercase();
        assert_eq!(WalletAddress::parse(&upper).unwrap(), address);
        assert!(matches!(
            WalletAddress::parse("not-a-key"),
            Err(WalletError::InvalidAddress { .. })
        ));
        assert!(WalletAddress::parse(&"ab".repeat(31)).is_err());
    }

    #[test]
    fn connection_signature_verifies_only_for_its_timestamp() {
        let (sk, address) = keypair(2);
        let signature = sign_message(&sk, &connection_message(&address, 1_700_000_000));
        let mut connection = WalletConnection {
            address,
            signature,
            timestamp: 1_700_000_000,
        };
        verify_wallet_connection(&connection).unwrap();

        connection.timestamp += 1;
        assert!(matches!(
            verify_wallet_connection(&connection),
            Err(WalletError::InvalidSignature(_))
        ));
    }

    #[test]
    fn foreign_key_cannot_sign_claims() {
        let (_, owner) = keypair(3);
        let (intruder, _) = keypair(4);
        let purchase = Digest32([5; 32]);
        let signature = sign_message(&intruder, &claim_message(&purchase));
        assert!(owner.verify(&claim_message(&purchase), &signature).is_err());
        assert!(matches!(
            owner.verify(b"x", "%%%"),
            Err(WalletError::MalformedSignature(_))
        ));
    }

    #[test]
    fn params_message_distinguishes_unset_fields() {
        let rate_only = ParamsUpdate {
            rewards_percentage_bp: Some(300),
            ..Default::default()
        };
        let with_thresholds = ParamsUpdate {
            tier_thresholds: Some([1, 2, 3]),
            ..rate_only.clone()
        };
        assert_eq!(
            params_message(&rate_only, 7),
            b"otto-rewards:params:300:-:-:7".to_vec()
        );
        assert_eq!(
            params_message(&with_thresholds, 7),
            b"otto-rewards:params:300:-:1,2,3:7".to_vec()
        );
        assert_ne!(holdings_message("ALICE", 5, 1), holdings_message("ALICE", 50, 1));
    }

    #[test]
    fn generated_codes_use_the_code_alphabet() {
        let mut rng = StdRng::seed_from_u64(9);
        let code = generate_referral_code(&mut rng);
        assert_eq!(code.len(), GENERATED_CODE_LEN);
        assert!(code.bytes().all(|b| REFERRAL_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn addresses_serialize_as_plain_strings() {
        let (_, address) = keypair(6);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{address}\""));
        let back: WalletAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
        assert!(serde_json::from_str::<WalletAddress>("\"zz\"").is_err());
    }
}
