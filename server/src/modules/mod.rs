//! Extension modules.
//!
//! Modules extend the core protocol with their own message families. Every
//! inbound message is offered to each module after the core handler has
//! processed it, but only while the connection is joined to a session.

use crate::connection::Outbox;
use crate::participant::Participant;
use crate::session::Session;
use skein_shared::Packet;
use std::sync::Arc;
use thiserror::Error;

pub mod dagaz;
pub mod odal;
pub mod vikja;

#[derive(Debug, Error)]
pub enum ModuleError {
    /// The module chose not to handle this message; the core moves on.
    #[error("message not handled by module")]
    Skip,
    /// Anything else terminates the connection.
    #[error("{0}")]
    Fatal(String),
}

/// A capability bundle that expands the server's feature set.
pub trait Module: Send {
    fn name(&self) -> &'static str;

    /// Binds the module to the joined session and participant. Called on
    /// every successful join.
    fn init(&mut self, session: &Arc<Session>, participant: &Arc<Participant>);

    /// Offers one message to the module. Modules are free to decide whether
    /// they handle it; [`ModuleError::Skip`] means they did not.
    fn handle_msg(&mut self, respond: &Outbox, packet: &Packet) -> Result<(), ModuleError>;

    /// Called when the participant leaves the session or disconnects.
    fn handle_disconnect(&mut self);
}
