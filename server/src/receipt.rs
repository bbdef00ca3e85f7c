//! Proof-of-work receipt verification and forwarding.
//!
//! The realtime handler enqueues receipts onto a bounded channel and answers
//! the client immediately; a background task drains the channel, sanity-checks
//! each payload and hands it to the credit service. A full channel is a
//! backpressure signal surfaced to the client as `SERVER_TOO_BUSY`, not a
//! fault.

use crate::crypto;
use crate::metrics;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the receipt channel shared by every connection.
pub const RECEIPT_CHAN_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptPayload {
    pub receipt: Vec<u8>,
    pub hash: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("receipt hash does not match the receipt")]
    HashMismatch,
    #[error("receipt signature is not recoverable")]
    BadSignature,
}

/// Sanity checks a payload: the hash must be the Keccak-256 of the receipt
/// and the signature must recover to some key against that hash.
pub fn verify_payload(payload: &ReceiptPayload) -> Result<(), ReceiptError> {
    let digest = crypto::keccak256(&payload.receipt);
    if digest.as_slice() != payload.hash.as_slice() {
        return Err(ReceiptError::HashMismatch);
    }

    crypto::recover_verifying_key(&payload.hash, &payload.signature)
        .map(|_| ())
        .map_err(|_| ReceiptError::BadSignature)
}

/// The external credit service receipts are forwarded to. The production
/// client lives outside the core; tests and unpaired runs use the logging
/// stub.
pub trait CreditService: Send + Sync {
    fn post_receipt(&self, payload: &ReceiptPayload) -> Result<(), String>;
}

/// Default sink that only records the forward attempt.
pub struct LoggingCreditService {
    pub endpoint: String,
}

impl CreditService for LoggingCreditService {
    fn post_receipt(&self, payload: &ReceiptPayload) -> Result<(), String> {
        log::debug!(
            "credit service {} would receive receipt ({} bytes)",
            self.endpoint,
            payload.receipt.len()
        );
        Ok(())
    }
}

/// Spawns the forwarder task draining the receipt channel.
pub fn spawn_forwarder(
    mut receipts: mpsc::Receiver<ReceiptPayload>,
    credit: Arc<dyn CreditService>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = receipts.recv().await {
            if let Err(err) = verify_payload(&payload) {
                metrics::inc(&metrics::RECEIPT_VERIFY_ERRORS);
                log::error!("invalid receipt payload: {}", err);
                continue;
            }

            match credit.post_receipt(&payload) {
                Ok(()) => metrics::inc(&metrics::RECEIPTS_FORWARDED),
                Err(err) => {
                    metrics::inc(&metrics::RECEIPT_FORWARD_ERRORS);
                    log::error!("forwarding receipt failed: {}", err);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{keccak256, sign_recoverable_hex, signing_key_from_hex};

    const TEST_KEY: &str = "0202020202020202020202020202020202020202020202020202020202020202";

    fn signed_payload(receipt: &[u8]) -> ReceiptPayload {
        let key = signing_key_from_hex(TEST_KEY).unwrap();
        let hash = keccak256(receipt);
        let signature_hex = sign_recoverable_hex(&key, &hash).unwrap();
        ReceiptPayload {
            receipt: receipt.to_vec(),
            hash: hash.to_vec(),
            signature: hex::decode(&signature_hex[2..]).unwrap(),
        }
    }

    #[test]
    fn test_valid_payload_passes() {
        assert_eq!(verify_payload(&signed_payload(b"work-receipt")), Ok(()));
    }

    #[test]
    fn test_hash_mismatch_is_rejected() {
        let mut payload = signed_payload(b"work-receipt");
        payload.receipt.push(0);
        assert_eq!(
            verify_payload(&payload),
            Err(ReceiptError::HashMismatch)
        );
    }

    #[test]
    fn test_junk_signature_is_rejected() {
        let mut payload = signed_payload(b"work-receipt");
        payload.signature = vec![0u8; 65];
        assert_eq!(verify_payload(&payload), Err(ReceiptError::BadSignature));

        payload.signature = vec![1, 2, 3];
        assert_eq!(verify_payload(&payload), Err(ReceiptError::BadSignature));
    }

    #[tokio::test]
    async fn test_forwarder_drains_the_channel() {
        let (tx, rx) = mpsc::channel(RECEIPT_CHAN_SIZE);
        let handle = spawn_forwarder(
            rx,
            Arc::new(LoggingCreditService {
                endpoint: "http://localhost:4040".to_string(),
            }),
        );

        let before = metrics::get(&metrics::RECEIPTS_FORWARDED);
        tx.send(signed_payload(b"work-receipt")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(metrics::get(&metrics::RECEIPTS_FORWARDED), before + 1);
    }
}
