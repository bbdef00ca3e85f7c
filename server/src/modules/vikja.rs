//! Vikja: named entity actions with last-writer-wins semantics.

use crate::connection::Outbox;
use crate::modules::{Module, ModuleError};
use crate::participant::Participant;
use crate::session::Session;
use parking_lot::RwLock;
use skein_shared::{EntityAction, ErrorCode, Packet, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-session action storage: entity id -> action name -> action.
#[derive(Default)]
pub struct State {
    actions: RwLock<HashMap<u32, HashMap<String, EntityAction>>>,
}

impl State {
    pub fn set_action(&self, action: EntityAction) {
        self.actions
            .write()
            .entry(action.entity_id)
            .or_default()
            .insert(action.name.clone(), action);
    }

    pub fn action(&self, entity_id: u32, name: &str) -> Option<EntityAction> {
        self.actions
            .read()
            .get(&entity_id)
            .and_then(|per_entity| per_entity.get(name))
            .cloned()
    }

    pub fn remove_entity_actions(&self, entity_id: u32) {
        self.actions.write().remove(&entity_id);
    }

    pub fn actions(&self) -> Vec<EntityAction> {
        self.actions
            .read()
            .values()
            .flat_map(|per_entity| per_entity.values().cloned())
            .collect()
    }
}

#[derive(Default)]
pub struct VikjaModule {
    session: Option<Arc<Session>>,
    participant: Option<Arc<Participant>>,
}

impl VikjaModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_participant_join(&self, respond: &Outbox) {
        let Some(session) = &self.session else { return };
        respond.send_packet(&Packet::VikjaState {
            timestamp: Timestamp::now(),
            entity_actions: session.modules.vikja.actions(),
        });
    }

    fn handle_entity_delete(&self, entity_id: u32) {
        let Some(session) = &self.session else { return };
        if session.entity_by_id(entity_id).is_none() {
            session.modules.vikja.remove_entity_actions(entity_id);
        }
    }

    fn handle_entity_action(
        &self,
        respond: &Outbox,
        request_id: u32,
        origin_timestamp: Timestamp,
        entity_action: &Option<EntityAction>,
    ) -> Result<(), ModuleError> {
        let (session, participant) = match (&self.session, &self.participant) {
            (Some(session), Some(participant)) => (session, participant),
            _ => return Err(ModuleError::Fatal("session not joined".to_string())),
        };

        let reject = |code: ErrorCode| {
            respond.send_packet(&Packet::ErrorResponse {
                timestamp: Timestamp::now(),
                request_id,
                code,
            });
        };

        let action = match entity_action {
            Some(action) if !action.name.is_empty() && action.timestamp.is_some() => action,
            _ => {
                reject(ErrorCode::BadRequest);
                return Ok(());
            }
        };

        if session.entity_by_id(action.entity_id).is_none() {
            reject(ErrorCode::BadRequest);
            return Ok(());
        }

        // Anti-replay: an already stored action with a later origin timestamp
        // wins over the incoming one.
        if let Some(stored) = session.modules.vikja.action(action.entity_id, &action.name) {
            if action.timestamp < stored.timestamp {
                reject(ErrorCode::BadRequest);
                return Ok(());
            }
        }

        session.modules.vikja.set_action(action.clone());

        let now = Timestamp::now();
        respond.send_packet(&Packet::EntityActionResponse {
            timestamp: now,
            request_id,
        });
        session.broadcast(
            participant.id,
            &Packet::EntityActionBroadcast {
                timestamp: now,
                origin_timestamp,
                entity_action: action.clone(),
            },
        );
        Ok(())
    }
}

impl Module for VikjaModule {
    fn name(&self) -> &'static str {
        "vikja"
    }

    fn init(&mut self, session: &Arc<Session>, participant: &Arc<Participant>) {
        self.session = Some(Arc::clone(session));
        self.participant = Some(Arc::clone(participant));
    }

    fn handle_msg(&mut self, respond: &Outbox, packet: &Packet) -> Result<(), ModuleError> {
        match packet {
            Packet::ParticipantJoinRequest { .. } => {
                self.handle_participant_join(respond);
                Ok(())
            }
            Packet::EntityDeleteRequest { entity_id, .. } => {
                self.handle_entity_delete(*entity_id);
                Ok(())
            }
            Packet::EntityActionRequest {
                timestamp,
                request_id,
                entity_action,
            } => self.handle_entity_action(respond, *request_id, *timestamp, entity_action),
            _ => Err(ModuleError::Skip),
        }
    }

    fn handle_disconnect(&mut self) {
        let (Some(session), Some(participant)) = (&self.session, &self.participant) else {
            return;
        };

        for entity_id in participant.entity_ids() {
            let keep = session
                .entity_by_id(entity_id)
                .map(|entity| entity.persist)
                .unwrap_or(false);
            if !keep {
                session.modules.vikja.remove_entity_actions(entity_id);
            }
        }
    }
}
