//! Per-connection pipeline.
//!
//! Every connection runs three cooperating tasks: a reader that decodes
//! frames and feeds the scheduler, a writer that drains the bounded outbox,
//! and the control loop below that owns the handler and reacts to ready
//! messages, the idle timer, the sync-clock ticker and disconnect signals.

use crate::handler::{HandlerEnv, HandlerError, RealtimeHandler};
use crate::metrics;
use crate::modules::dagaz::DagazModule;
use crate::modules::odal::OdalModule;
use crate::modules::vikja::VikjaModule;
use crate::modules::Module;
use crate::scheduler::Scheduler;
use futures_util::{SinkExt, StreamExt};
use skein_shared::{decode_packet, encode_packet, Packet};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Capacity of each connection's outbound frame queue.
pub const SEND_CHAN_SIZE: usize = 512;

/// Handle used to queue frames for one connection. Pushes never block: a
/// slow consumer fills its own queue and is detected by its own pipeline
/// instead of stalling whoever is broadcasting.
#[derive(Debug, Clone)]
pub struct Outbox {
    frames: mpsc::Sender<Vec<u8>>,
}

impl Outbox {
    pub fn channel() -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (frames, rx) = mpsc::channel(SEND_CHAN_SIZE);
        (Self { frames }, rx)
    }

    /// Queues an already-encoded frame. Returns false when the queue is full
    /// or the connection is gone.
    pub fn try_send_frame(&self, frame: Vec<u8>) -> bool {
        self.frames.try_send(frame).is_ok()
    }

    /// Encodes and queues a packet. Encoding failures and a full queue drop
    /// the message; only a closed connection reports false.
    pub fn send_packet(&self, packet: &Packet) -> bool {
        let frame = match encode_packet(packet) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("encoding {} failed: {}", packet.kind(), err);
                return true;
            }
        };

        match self.frames.try_send(frame) {
            Ok(()) => {
                metrics::inc(&metrics::MESSAGES_SENT);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::inc(&metrics::BROADCAST_DROPPED);
                log::warn!("send queue full, dropping {}", packet.kind());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Why a connection ended.
#[derive(Debug)]
pub enum Disconnect {
    Idle,
    Shutdown,
    Transport(String),
    Protocol(String),
    Handler(HandlerError),
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Idle => write!(f, "idle connection"),
            Disconnect::Shutdown => write!(f, "server shutting down"),
            Disconnect::Transport(reason) | Disconnect::Protocol(reason) => {
                write!(f, "{}", reason)
            }
            Disconnect::Handler(err) => write!(f, "handling message failed: {}", err),
        }
    }
}

/// Per-connection timing knobs, taken from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub sync_clock_interval: Duration,
    pub idle_timeout: Duration,
    pub log_summary_interval: Duration,
}

/// Runs one client connection to completion.
pub async fn handle_connection(
    stream: WebSocketStream<TcpStream>,
    env: HandlerEnv,
    settings: ConnectionSettings,
    client_id: String,
    app_key: String,
    mut shutdown: watch::Receiver<bool>,
) {
    metrics::inc(&metrics::CONNECTIONS_OPEN);
    log::info!("new client connected client_id={:?}", client_id);

    let (sink, source) = stream.split();
    let (outbox, out_rx) = Outbox::channel();
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<Disconnect>(8);
    let (scheduler, mut ready_rx) = Scheduler::new();

    let writer = tokio::spawn(write_loop(sink, out_rx, disconnect_tx.clone()));
    let reader = tokio::spawn(read_loop(source, Arc::clone(&scheduler), disconnect_tx));

    let modules: Vec<Box<dyn Module>> = vec![
        Box::new(VikjaModule::new()),
        Box::new(OdalModule::new()),
        Box::new(DagazModule::new()),
    ];
    let mut handler = RealtimeHandler::new(
        env,
        modules,
        Arc::clone(&scheduler),
        outbox.clone(),
        client_id.clone(),
        app_key,
    );

    let mut inbound_counts: HashMap<&'static str, u64> = HashMap::new();

    let idle = tokio::time::sleep(settings.idle_timeout);
    tokio::pin!(idle);
    let start = tokio::time::Instant::now();
    let mut sync_clock = tokio::time::interval_at(
        start + settings.sync_clock_interval,
        settings.sync_clock_interval,
    );
    let mut summary = tokio::time::interval_at(
        start + settings.log_summary_interval,
        settings.log_summary_interval,
    );

    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => break Disconnect::Shutdown,

            _ = &mut idle => break Disconnect::Idle,

            _ = sync_clock.tick() => {
                if !handler.send_sync_clock() {
                    break Disconnect::Transport("sending sync clock failed".to_string());
                }
            }

            _ = summary.tick() => {
                log_summary(&client_id, &mut inbound_counts, settings.log_summary_interval);
            }

            Some(packet) = ready_rx.recv() => {
                idle.as_mut().reset(tokio::time::Instant::now() + settings.idle_timeout);
                metrics::inc(&metrics::MESSAGES_RECEIVED);
                *inbound_counts.entry(packet.kind()).or_insert(0) += 1;

                let mut handled = handler.handle_packet(&packet);
                if handled.is_ok() {
                    handled = handler.handle_with_modules(&packet);
                }
                if let Err(err) = handled {
                    break Disconnect::Handler(err);
                }
            }

            maybe = disconnect_rx.recv() => {
                break maybe.unwrap_or_else(|| {
                    Disconnect::Transport("connection closed".to_string())
                });
            }
        }
    };

    handler.handle_disconnect();
    log::info!(
        "client disconnected client_id={:?} reason={}",
        client_id,
        reason
    );
    log_summary(&client_id, &mut inbound_counts, settings.log_summary_interval);

    // Dropping the handler releases the last outbox clones (participants and
    // modules), which lets the writer drain and exit.
    drop(handler);
    drop(outbox);
    reader.abort();
    let _ = writer.await;

    metrics::dec(&metrics::CONNECTIONS_OPEN);
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    disconnect: mpsc::Sender<Disconnect>,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(err) = sink.send(Message::Binary(frame)).await {
            let _ = disconnect.try_send(Disconnect::Transport(format!(
                "sending message failed: {}",
                err
            )));
            break;
        }
    }

    // Drain anything still queued so producers are never left blocked on a
    // dead connection, then say goodbye.
    while out_rx.try_recv().is_ok() {}
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    scheduler: Arc<Scheduler>,
    disconnect: mpsc::Sender<Disconnect>,
) {
    while let Some(received) = source.next().await {
        match received {
            Ok(Message::Binary(bytes)) => match decode_packet(&bytes) {
                Ok(packet) => {
                    if scheduler.dispatch(packet).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = disconnect.try_send(Disconnect::Protocol(format!(
                        "decoding message failed: {}",
                        err
                    )));
                    return;
                }
            },
            Ok(Message::Close(_)) => {
                let _ = disconnect
                    .try_send(Disconnect::Transport("client closed connection".to_string()));
                return;
            }
            Ok(Message::Text(_)) => {
                let _ = disconnect
                    .try_send(Disconnect::Protocol("unexpected text frame".to_string()));
                return;
            }
            Ok(_) => {}
            Err(err) => {
                let _ = disconnect.try_send(Disconnect::Transport(format!(
                    "receiving message failed: {}",
                    err
                )));
                return;
            }
        }
    }

    let _ = disconnect.try_send(Disconnect::Transport("connection closed".to_string()));
}

/// Emits one info line summarizing inbound traffic by message kind, then
/// resets the counters. Quiet intervals log nothing.
fn log_summary(
    client_id: &str,
    counts: &mut HashMap<&'static str, u64>,
    interval: Duration,
) {
    if counts.is_empty() {
        return;
    }

    let mut entries: Vec<String> = counts
        .drain()
        .map(|(kind, count)| format!("{}={}", kind, count))
        .collect();
    entries.sort();

    log::info!(
        "inbound message summary client_id={:?} interval={:?} {}",
        client_id,
        interval,
        entries.join(" ")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_shared::Timestamp;

    fn ping() -> Packet {
        Packet::PingRequest {
            timestamp: Timestamp::now(),
            request_id: 1,
        }
    }

    #[test]
    fn test_outbox_delivers_encoded_frames() {
        let (outbox, mut rx) = Outbox::channel();
        assert!(outbox.send_packet(&ping()));

        let frame = rx.try_recv().unwrap();
        assert!(matches!(
            decode_packet(&frame).unwrap(),
            Packet::PingRequest { request_id: 1, .. }
        ));
    }

    #[test]
    fn test_outbox_reports_closed_connection() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        assert!(!outbox.send_packet(&ping()));
    }

    #[test]
    fn test_outbox_drops_on_full_queue_without_blocking() {
        let (outbox, _rx) = Outbox::channel();
        for _ in 0..SEND_CHAN_SIZE {
            assert!(outbox.try_send_frame(vec![0]));
        }
        // The queue is full: frames are dropped, the connection stays up.
        assert!(!outbox.try_send_frame(vec![0]));
        assert!(outbox.send_packet(&ping()));
    }

    #[test]
    fn test_summary_resets_counters() {
        let mut counts = HashMap::new();
        counts.insert("ping_request", 3u64);
        log_summary("client", &mut counts, Duration::from_secs(60));
        assert!(counts.is_empty());
    }
}
