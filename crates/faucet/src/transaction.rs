//! Funding account and EIP-155 legacy transfers

use k256::ecdsa::SigningKey;
use rlp::RlpStream;
use spigot_common::{Address, Hash};
use std::fmt;

use crate::config::ConfigError;
use crate::error::{FaucetError, FaucetResult};

/// The faucet's signing identity. The key never leaves this type.
pub struct FundingAccount {
    signing_key: SigningKey,
    address: Address,
}

impl FundingAccount {
    /// Parse a 32-byte hex private key, `0x` optional
    pub fn from_hex(key: &str) -> Result<Self, ConfigError> {
        let key = key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let bytes = hex::decode(key).map_err(|e| ConfigError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ConfigError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|e| ConfigError::InvalidKey(e.to_string()))?;

        let encoded = signing_key.verifying_key().to_encoded_point(false);
        let address = Address::from_uncompressed_pubkey(encoded.as_bytes());

        Ok(Self { signing_key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub(crate) fn sign(&self, tx: &TransferTx) -> FaucetResult<SignedTransfer> {
        let digest = Hash::keccak(&tx.signing_payload());
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&digest.0)
            .map_err(|e| FaucetError::InternalError(format!("signing failed: {}", e)))?;

        let v = tx.chain_id * 2 + 35 + u64::from(recovery_id.to_byte());
        let (r, s) = signature.split_bytes();

        let mut stream = RlpStream::new_list(9);
        tx.append_body(&mut stream);
        stream.append(&v);
        stream.append(&trim_leading_zeros(&r));
        stream.append(&trim_leading_zeros(&s));
        let raw = stream.out().to_vec();

        Ok(SignedTransfer {
            nonce: tx.nonce,
            to: tx.to,
            value: tx.value,
            hash: Hash::keccak(&raw),
            raw,
        })
    }
}

impl fmt::Debug for FundingAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FundingAccount")
            .field("address", &self.address)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

/// Unsigned native-currency transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTx {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub chain_id: u64,
}

impl TransferTx {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&self.to.0.to_vec());
        stream.append(&trim_leading_zeros(&self.value.to_be_bytes()));
        stream.append(&Vec::<u8>::new()); // data
    }

    /// EIP-155 signing payload: the six body fields followed by `chain_id, 0, 0`
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&self.chain_id);
        stream.append(&0u8);
        stream.append(&0u8);
        stream.out().to_vec()
    }
}

/// A signed, encoded transfer ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    pub nonce: u64,
    pub to: Address,
    pub value: u128,
    pub hash: Hash,
    pub raw: Vec<u8>,
}

/// RLP integers are big-endian without leading zeros
fn trim_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}
