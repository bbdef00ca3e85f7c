//! Session participants.

use crate::connection::Outbox;
use parking_lot::RwLock;
use skein_shared::ParticipantState;
use std::collections::HashSet;

/// A single joined client's presence within one session.
///
/// Participants hold the ids of the entities they own rather than entity
/// handles; the session's entity map stays the authoritative owner. The
/// responder is the bounded outbox drained by the connection's writer task.
#[derive(Debug)]
pub struct Participant {
    pub id: u32,
    pub responder: Outbox,
    entity_ids: RwLock<HashSet<u32>>,
}

impl Participant {
    pub fn new(id: u32, responder: Outbox) -> Self {
        Self {
            id,
            responder,
            entity_ids: RwLock::new(HashSet::new()),
        }
    }

    pub fn add_entity(&self, entity_id: u32) {
        self.entity_ids.write().insert(entity_id);
    }

    pub fn remove_entity(&self, entity_id: u32) {
        self.entity_ids.write().remove(&entity_id);
    }

    pub fn entity_ids(&self) -> Vec<u32> {
        self.entity_ids.read().iter().copied().collect()
    }

    pub fn to_state(&self) -> ParticipantState {
        ParticipantState { id: self.id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_tracking() {
        let (outbox, _rx) = Outbox::channel();
        let participant = Participant::new(1, outbox);

        participant.add_entity(10);
        participant.add_entity(11);
        participant.remove_entity(10);

        assert_eq!(participant.entity_ids(), vec![11]);
        assert_eq!(participant.to_state(), ParticipantState { id: 1 });
    }
}
