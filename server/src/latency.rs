//! Signed latency probes.
//!
//! A probe is a bounded run of server-initiated pings. Each round trip is
//! timed; once the last response arrives the aggregate is marshalled, hashed
//! with Keccak-256 and signed with the server's key so the client can present
//! the measurement to third parties.

use crate::connection::Outbox;
use crate::crypto;
use k256::ecdsa::SigningKey;
use skein_shared::{LatencyData, Packet, Timestamp};
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;

/// Allowed `iteration_count` bounds, validated at the message boundary.
pub const MIN_ITERATIONS: u32 = 2;
pub const MAX_ITERATIONS: u32 = 32;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to marshal latency data: {0}")]
    Marshal(String),
    #[error("failed to sign latency data: {0}")]
    Sign(String),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProbeStatus {
    InFlight,
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct PingSample {
    started_at: Instant,
    completed_at: Option<Instant>,
}

/// One in-flight latency probe. Lives from the `SignedLatencyRequest` until
/// the aggregate response is sent.
pub struct SignedLatencyProbe {
    request_id: u32,
    remaining: u32,
    session_id: String,
    client_id: String,
    wallet_address: String,
    pings: HashMap<u32, PingSample>,
    order: Vec<u32>,
}

impl SignedLatencyProbe {
    /// Records the probe parameters and emits the first ping.
    pub fn start(
        request_id: u32,
        iteration_count: u32,
        session_id: String,
        client_id: String,
        wallet_address: String,
        respond: &Outbox,
    ) -> Self {
        let mut probe = Self {
            request_id,
            remaining: iteration_count,
            session_id,
            client_id,
            wallet_address,
            pings: HashMap::with_capacity(iteration_count as usize),
            order: Vec::with_capacity(iteration_count as usize),
        };
        probe.send_ping(respond);
        probe
    }

    /// Handles one `PingResponse`. Unknown request ids are logged and
    /// ignored. Returns `Completed` once the signed aggregate has been sent.
    pub fn handle_ping_response(
        &mut self,
        ping_request_id: u32,
        respond: &Outbox,
        signing_key: &SigningKey,
    ) -> Result<ProbeStatus, ProbeError> {
        match self.pings.get_mut(&ping_request_id) {
            Some(sample) if sample.completed_at.is_none() => {
                sample.completed_at = Some(Instant::now());
            }
            _ => {
                log::warn!("ping request {} not found in probe", ping_request_id);
                return Ok(ProbeStatus::InFlight);
            }
        }

        self.remaining -= 1;
        if self.remaining > 0 {
            self.send_ping(respond);
            return Ok(ProbeStatus::InFlight);
        }

        self.finish(respond, signing_key)?;
        Ok(ProbeStatus::Completed)
    }

    fn send_ping(&mut self, respond: &Outbox) {
        // Ping request ids are unix nanos truncated to 32 bits; bump on the
        // unlikely collision within one probe.
        let mut ping_request_id = Timestamp::now().as_nanos() as u32;
        while self.pings.contains_key(&ping_request_id) {
            ping_request_id = ping_request_id.wrapping_add(1);
        }

        self.pings.insert(
            ping_request_id,
            PingSample {
                started_at: Instant::now(),
                completed_at: None,
            },
        );
        self.order.push(ping_request_id);

        respond.send_packet(&Packet::PingRequest {
            timestamp: Timestamp::now(),
            request_id: ping_request_id,
        });
    }

    fn finish(&self, respond: &Outbox, signing_key: &SigningKey) -> Result<(), ProbeError> {
        let latencies: Vec<f32> = self
            .order
            .iter()
            .filter_map(|id| {
                let sample = self.pings.get(id)?;
                let end = sample.completed_at?;
                Some(end.duration_since(sample.started_at).as_micros() as f32)
            })
            .collect();

        let summary = aggregate(&latencies);

        let data = LatencyData {
            created_at: Timestamp::now(),
            min: summary.min,
            max: summary.max,
            mean: summary.mean,
            p95: summary.p95,
            last: summary.last,
            iteration_count: self.pings.len() as u32,
            ping_request_ids: self.pings.keys().copied().collect(),
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            wallet_address: self.wallet_address.clone(),
        };

        let marshalled =
            bincode::serialize(&data).map_err(|err| ProbeError::Marshal(err.to_string()))?;
        let digest = crypto::keccak256(&marshalled);
        let signature = crypto::sign_recoverable_hex(signing_key, &digest)
            .map_err(|err| ProbeError::Sign(err.to_string()))?;

        respond.send_packet(&Packet::SignedLatencyResponse {
            timestamp: Timestamp::now(),
            request_id: self.request_id,
            data,
            signature,
        });
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct Aggregate {
    min: f32,
    max: f32,
    mean: f32,
    p95: f32,
    last: f32,
}

/// Latency summary over microsecond samples: min, max, rounded mean, the
/// p95 sample (index `floor(0.95·N) - 1`, clamped to a valid index) and the
/// last sample in insertion order.
fn aggregate(latencies: &[f32]) -> Aggregate {
    if latencies.is_empty() {
        return Aggregate {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p95: 0.0,
            last: 0.0,
        };
    }

    let count = latencies.len();
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f32;
    for &latency in latencies {
        min = min.min(latency);
        max = max.max(latency);
        sum += latency;
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let p95_index = (((0.95 * count as f32).floor() as i64) - 1).clamp(0, count as i64 - 1);

    Aggregate {
        min,
        max,
        mean: (sum / count as f32).round(),
        p95: sorted[p95_index as usize],
        last: latencies[count - 1],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{keccak256, recover_verifying_key, signing_key_from_hex};
    use skein_shared::decode_packet;

    const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn test_aggregate_math() {
        let latencies = [300.0, 100.0, 200.0, 250.0];
        let summary = aggregate(&latencies);

        assert_eq!(summary.min, 100.0);
        assert_eq!(summary.max, 300.0);
        assert_eq!(summary.mean, 213.0); // round(212.5)
        // floor(0.95 * 4) - 1 = 2 -> sorted[2] = 250.
        assert_eq!(summary.p95, 250.0);
        assert_eq!(summary.last, 250.0);
    }

    #[test]
    fn test_aggregate_clamps_p95_for_tiny_sets() {
        let summary = aggregate(&[50.0]);
        assert_eq!(summary.p95, 50.0);
        assert_eq!(summary.mean, 50.0);

        let summary = aggregate(&[10.0, 30.0]);
        // floor(0.95 * 2) - 1 = 0 -> sorted[0].
        assert_eq!(summary.p95, 10.0);
    }

    #[test]
    fn test_probe_runs_to_a_signed_response() {
        let (outbox, mut rx) = Outbox::channel();
        let signing_key = signing_key_from_hex(TEST_KEY).unwrap();

        let mut probe = SignedLatencyProbe::start(
            9,
            2,
            "tedx1".to_string(),
            "client".to_string(),
            "0x123456789".to_string(),
            &outbox,
        );

        let first_ping = match decode_packet(&rx.try_recv().unwrap()).unwrap() {
            Packet::PingRequest { request_id, .. } => request_id,
            other => panic!("expected ping request, got {}", other.kind()),
        };

        assert_eq!(
            probe
                .handle_ping_response(first_ping, &outbox, &signing_key)
                .unwrap(),
            ProbeStatus::InFlight
        );

        let second_ping = match decode_packet(&rx.try_recv().unwrap()).unwrap() {
            Packet::PingRequest { request_id, .. } => request_id,
            other => panic!("expected ping request, got {}", other.kind()),
        };

        assert_eq!(
            probe
                .handle_ping_response(second_ping, &outbox, &signing_key)
                .unwrap(),
            ProbeStatus::Completed
        );

        match decode_packet(&rx.try_recv().unwrap()).unwrap() {
            Packet::SignedLatencyResponse {
                request_id,
                data,
                signature,
                ..
            } => {
                assert_eq!(request_id, 9);
                assert_eq!(data.iteration_count, 2);
                assert_eq!(data.session_id, "tedx1");
                assert_eq!(data.wallet_address, "0x123456789");
                assert_eq!(data.ping_request_ids.len(), 2);

                // The signature must verify against keccak256 of the
                // marshalled data under the server's key.
                let marshalled = bincode::serialize(&data).unwrap();
                let digest = keccak256(&marshalled);
                let bytes = hex::decode(signature.trim_start_matches("0x")).unwrap();
                let recovered = recover_verifying_key(&digest, &bytes).unwrap();
                assert_eq!(&recovered, signing_key.verifying_key());
            }
            other => panic!("expected signed latency response, got {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_ping_is_ignored() {
        let (outbox, mut rx) = Outbox::channel();
        let signing_key = signing_key_from_hex(TEST_KEY).unwrap();

        let mut probe = SignedLatencyProbe::start(
            1,
            2,
            String::new(),
            String::new(),
            "0x1".to_string(),
            &outbox,
        );
        let first_ping = match decode_packet(&rx.try_recv().unwrap()).unwrap() {
            Packet::PingRequest { request_id, .. } => request_id,
            other => panic!("expected ping request, got {}", other.kind()),
        };

        assert_eq!(
            probe
                .handle_ping_response(first_ping.wrapping_add(1), &outbox, &signing_key)
                .unwrap(),
            ProbeStatus::InFlight
        );
        // No new ping was issued for the unknown response.
        assert!(rx.try_recv().is_err());
    }
}
