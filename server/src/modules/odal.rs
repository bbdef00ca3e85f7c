//! Odal: asset instances bound to entities.

use crate::connection::Outbox;
use crate::id::IdAllocator;
use crate::modules::{Module, ModuleError};
use crate::participant::Participant;
use crate::session::Session;
use parking_lot::RwLock;
use skein_shared::{AssetInstance, ErrorCode, Packet, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-session asset storage: at most one instance per entity.
#[derive(Default)]
pub struct State {
    ids: IdAllocator,
    instances: RwLock<HashMap<u32, AssetInstance>>,
}

impl State {
    pub fn new_instance_id(&self) -> u32 {
        self.ids.next()
    }

    pub fn set_instance(&self, instance: AssetInstance) {
        self.instances.write().insert(instance.entity_id, instance);
    }

    pub fn remove_instance(&self, entity_id: u32) {
        self.instances.write().remove(&entity_id);
    }

    pub fn instance(&self, entity_id: u32) -> Option<AssetInstance> {
        self.instances.read().get(&entity_id).cloned()
    }

    pub fn instances(&self) -> Vec<AssetInstance> {
        self.instances.read().values().cloned().collect()
    }
}

#[derive(Default)]
pub struct OdalModule {
    session: Option<Arc<Session>>,
    participant: Option<Arc<Participant>>,
}

impl OdalModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_participant_join(&self, respond: &Outbox) {
        let Some(session) = &self.session else { return };
        respond.send_packet(&Packet::OdalState {
            timestamp: Timestamp::now(),
            asset_instances: session.modules.odal.instances(),
        });
    }

    fn handle_entity_delete(&self, entity_id: u32) {
        let Some(session) = &self.session else { return };
        if session.entity_by_id(entity_id).is_none() {
            session.modules.odal.remove_instance(entity_id);
        }
    }

    fn handle_asset_instance_add(
        &self,
        respond: &Outbox,
        request_id: u32,
        origin_timestamp: Timestamp,
        asset_id: &str,
        entity_id: u32,
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

        if asset_id.is_empty() {
            reject(ErrorCode::BadRequest);
            return Ok(());
        }

        let entity = match session.entity_by_id(entity_id) {
            Some(entity) => entity,
            None => {
                reject(ErrorCode::NotFound);
                return Ok(());
            }
        };

        if entity.participant_id != participant.id {
            reject(ErrorCode::Unauthorized);
            return Ok(());
        }

        let instance = AssetInstance {
            id: session.modules.odal.new_instance_id(),
            asset_id: asset_id.to_string(),
            participant_id: participant.id,
            entity_id: entity.id,
        };
        session.modules.odal.set_instance(instance.clone());

        let now = Timestamp::now();
        respond.send_packet(&Packet::AssetInstanceAddResponse {
            timestamp: now,
            request_id,
            asset_instance_id: instance.id,
        });
        session.broadcast(
            participant.id,
            &Packet::AssetInstanceAddBroadcast {
                timestamp: now,
                origin_timestamp,
                asset_instance: instance,
            },
        );
        Ok(())
    }
}

impl Module for OdalModule {
    fn name(&self) -> &'static str {
        "odal"
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
            Packet::AssetInstanceAddRequest {
                timestamp,
                request_id,
                asset_id,
                entity_id,
            } => self.handle_asset_instance_add(
                respond,
                *request_id,
                *timestamp,
                asset_id,
                *entity_id,
            ),
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
                session.modules.odal.remove_instance(entity_id);
            }
        }
    }
}
