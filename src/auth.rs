//! Principal signatures.
//!
//! Requests that act for a principal without going through its delegated
//! signer carry an EIP-191 personal signature over a fixed message. The
//! address recovered from that signature is the principal.

use crate::error::{Error, Result};
use alloy::primitives::{Address, Signature, TxHash, U256};

/// Message a principal signs to ask for a delegated signer.
#[must_use]
pub fn create_signer_message(principal: Address, daily_limit: U256) -> String {
    format!("agentpay:create-agent:{principal}:{daily_limit}")
}

/// Message a principal signs to redeem `tx_hash` for `resource_id`.
#[must_use]
pub fn dataset_message(tx_hash: TxHash, resource_id: u64) -> String {
    format!("agentpay:dataset:{tx_hash}:{resource_id}")
}

/// Recover the address that signed `message`.
///
/// `signature` is the 65-byte `r || s || v` encoding in hex, with or
/// without a `0x` prefix.
///
/// # Errors
///
/// Returns `Unauthorized` if the signature is malformed or does not recover.
pub fn recover_principal(message: &str, signature: &str) -> Result<Address> {
    let bytes = hex::decode(signature.trim().trim_start_matches("0x"))
        .map_err(|_| Error::Unauthorized("signature is not hex".to_string()))?;
    let signature = Signature::try_from(bytes.as_slice())
        .map_err(|_| Error::Unauthorized("malformed signature".to_string()))?;
    signature
        .recover_address_from_msg(message)
        .map_err(|_| Error::Unauthorized("signature does not recover".to_string()))
}

/// Check that `signature` over `message` was made by `principal`.
///
/// # Errors
///
/// Returns `Unauthorized` if it was not.
pub fn ensure_signed_by(principal: Address, message: &str, signature: &str) -> Result<()> {
    let recovered = recover_principal(message, signature)?;
    if recovered == principal {
        Ok(())
    } else {
        Err(Error::Unauthorized(format!("request is not signed by {principal}")))
    }
}
