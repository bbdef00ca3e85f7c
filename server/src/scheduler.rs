//! Two-lane inbound message scheduling.
//!
//! The receiver task pushes every decoded message through the scheduler,
//! which decides whether it is released to the control loop immediately or
//! held until the joined session's next frame tick. Pose updates and the
//! other broadcast-heavy mutations ride the deferred lane so their fan-out is
//! aligned with the frame; everything else passes straight through.

use parking_lot::Mutex;
use skein_shared::Packet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Returned when the control loop has gone away and messages have nowhere to
/// be delivered.
#[derive(Debug, PartialEq, Eq)]
pub struct SchedulerClosed;

pub struct Scheduler {
    ready_tx: mpsc::UnboundedSender<Packet>,
    deferred: Mutex<Vec<Packet>>,
}

impl Scheduler {
    /// Creates a scheduler plus the ready-message queue read by the control
    /// loop.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ready_tx,
                deferred: Mutex::new(Vec::new()),
            }),
            ready_rx,
        )
    }

    /// Routes one received message into its lane. Messages are delivered in
    /// receive order within a lane; deferred messages observed before a frame
    /// tick are released before anything received after that tick.
    pub fn dispatch(&self, packet: Packet) -> Result<(), SchedulerClosed> {
        if is_frame_deferred(&packet) {
            self.deferred.lock().push(packet);
            return Ok(());
        }
        self.ready_tx.send(packet).map_err(|_| SchedulerClosed)
    }

    /// Frame-tick callback registered with the joined session: drains the
    /// deferred lane into the ready queue.
    pub fn flush_frame(&self) {
        let drained = std::mem::take(&mut *self.deferred.lock());
        for packet in drained {
            if self.ready_tx.send(packet).is_err() {
                return;
            }
        }
    }
}

/// The broadcast-heavy no-reply mutations ride the frame-deferred lane.
fn is_frame_deferred(packet: &Packet) -> bool {
    matches!(
        packet,
        Packet::EntityUpdatePose { .. }
            | Packet::EntityComponentUpdate { .. }
            | Packet::CustomMessage { .. }
    )
}
