//! secp256k1 signing and Keccak-256 hashing helpers.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid private key hex: {0}")]
    InvalidHex(String),
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature is not recoverable")]
    Unrecoverable,
}

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

/// Parses a hex private key, tolerating surrounding whitespace and an
/// optional `0x` prefix.
pub fn signing_key_from_hex(raw: &str) -> Result<SigningKey, CryptoError> {
    let trimmed = raw.trim().trim_start_matches("0x");
    let bytes = hex::decode(trimmed).map_err(|err| CryptoError::InvalidHex(err.to_string()))?;
    SigningKey::from_slice(&bytes).map_err(|err| CryptoError::InvalidKey(err.to_string()))
}

/// Signs a 32-byte digest and returns the 65-byte recoverable signature
/// (r ‖ s ‖ v) as lower-case hex with a `0x` prefix.
pub fn sign_recoverable_hex(key: &SigningKey, prehash: &[u8; 32]) -> Result<String, CryptoError> {
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(prehash)
        .map_err(|err| CryptoError::SignFailed(err.to_string()))?;

    let mut bytes = signature.to_bytes().to_vec();
    bytes.push(recovery_id.to_byte());
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Recovers the public key from a 65-byte (r ‖ s ‖ v) signature over the
/// given digest. The recovery byte may be 0/1 or the legacy 27/28.
pub fn recover_verifying_key(
    prehash: &[u8],
    signature: &[u8],
) -> Result<VerifyingKey, CryptoError> {
    if signature.len() != 65 {
        return Err(CryptoError::MalformedSignature);
    }

    let mut v = signature[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id = RecoveryId::from_byte(v).ok_or(CryptoError::MalformedSignature)?;
    let signature =
        Signature::from_slice(&signature[..64]).map_err(|_| CryptoError::MalformedSignature)?;

    VerifyingKey::recover_from_prehash(prehash, &signature, recovery_id)
        .map_err(|_| CryptoError::Unrecoverable)
}

/// Ethereum-style wallet address of a public key: the last 20 bytes of the
/// Keccak-256 of the uncompressed point, lower-case hex with `0x` prefix.
pub fn wallet_address(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}
