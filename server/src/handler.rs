//! The realtime message state machine.
//!
//! One handler instance lives per connection. It is either `Connected` (no
//! session) or `Joined` (has a participant in a session); each message kind
//! is only honoured in the state its contract requires. Client-attributable
//! problems become `ErrorResponse` frames and the connection survives;
//! returning an error from here terminates the connection.

use crate::connection::Outbox;
use crate::featureflag::{FeatureFlags, Flag};
use crate::latency::{self, ProbeStatus, SignedLatencyProbe};
use crate::modules::{Module, ModuleError};
use crate::participant::Participant;
use crate::receipt::ReceiptPayload;
use crate::scheduler::Scheduler;
use crate::session::{FrameHandle, Session, SessionStore};
use k256::ecdsa::SigningKey;
use skein_shared::{
    EntityComponent, EntityFlag, ErrorCode, Packet, Pose, Timestamp, CUSTOM_MESSAGE_MAX_SIZE,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("session not joined while handling {msg_type}")]
    NotJoined { msg_type: &'static str },
    #[error("signed latency probe failed: {0}")]
    Latency(#[from] latency::ProbeError),
    #[error("module {module} failed: {reason}")]
    Module { module: &'static str, reason: String },
}

/// Process-wide dependencies shared by every connection's handler.
#[derive(Clone)]
pub struct HandlerEnv {
    pub sessions: Arc<SessionStore>,
    pub flags: Arc<FeatureFlags>,
    pub receipts: mpsc::Sender<ReceiptPayload>,
    pub signing_key: Arc<SigningKey>,
    pub frame_duration: Duration,
}

pub struct RealtimeHandler {
    env: HandlerEnv,
    modules: Vec<Box<dyn Module>>,
    scheduler: Arc<Scheduler>,
    outbox: Outbox,
    client_id: String,
    app_key: String,

    current_session: Option<Arc<Session>>,
    current_participant: Option<Arc<Participant>>,
    frame_handle: Option<FrameHandle>,
    latency_probe: Option<SignedLatencyProbe>,
}

impl RealtimeHandler {
    pub fn new(
        env: HandlerEnv,
        modules: Vec<Box<dyn Module>>,
        scheduler: Arc<Scheduler>,
        outbox: Outbox,
        client_id: String,
        app_key: String,
    ) -> Self {
        Self {
            env,
            modules,
            scheduler,
            outbox,
            client_id,
            app_key,
            current_session: None,
            current_participant: None,
            frame_handle: None,
            latency_probe: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn current_session(&self) -> Option<&Arc<Session>> {
        self.current_session.as_ref()
    }

    pub fn current_participant(&self) -> Option<&Arc<Participant>> {
        self.current_participant.as_ref()
    }

    /// Routes one ready message. Returning an error terminates the
    /// connection.
    pub fn handle_packet(&mut self, packet: &Packet) -> Result<(), HandlerError> {
        match packet {
            Packet::PingRequest { request_id, .. } => {
                self.handle_ping(*request_id);
                Ok(())
            }
            Packet::PingResponse { request_id, .. } => self.handle_ping_response(*request_id),
            Packet::SignedLatencyRequest {
                request_id,
                iteration_count,
                wallet_address,
                ..
            } => {
                self.handle_signed_latency(*request_id, *iteration_count, wallet_address);
                Ok(())
            }
            Packet::ParticipantJoinRequest {
                timestamp,
                request_id,
                session_id,
            } => {
                self.handle_participant_join(*timestamp, *request_id, session_id);
                Ok(())
            }
            Packet::EntityAddRequest {
                timestamp,
                request_id,
                pose,
                persist,
                flag,
            } => self.handle_entity_add(*timestamp, *request_id, *pose, *persist, *flag),
            Packet::EntityDeleteRequest {
                timestamp,
                request_id,
                entity_id,
            } => self.handle_entity_delete(*timestamp, *request_id, *entity_id),
            Packet::EntityUpdatePose {
                timestamp,
                entity_id,
                pose,
            } => self.handle_entity_update_pose(*timestamp, *entity_id, *pose),
            Packet::CustomMessage {
                timestamp,
                participant_ids,
                body,
            } => self.handle_custom_message(*timestamp, participant_ids, body),
            Packet::EntityComponentTypeAddRequest {
                request_id, name, ..
            } => self.handle_component_type_add(*request_id, name),
            Packet::EntityComponentTypeGetNameRequest {
                request_id,
                component_type_id,
                ..
            } => self.handle_component_type_get_name(*request_id, *component_type_id),
            Packet::EntityComponentTypeGetIdRequest {
                request_id, name, ..
            } => self.handle_component_type_get_id(*request_id, name),
            Packet::EntityComponentAddRequest {
                timestamp,
                request_id,
                component_type_id,
                entity_id,
                data,
            } => self.handle_component_add(
                *timestamp,
                *request_id,
                *component_type_id,
                *entity_id,
                data,
            ),
            Packet::EntityComponentDeleteRequest {
                timestamp,
                request_id,
                component_type_id,
                entity_id,
            } => self.handle_component_delete(
                *timestamp,
                *request_id,
                *component_type_id,
                *entity_id,
            ),
            Packet::EntityComponentUpdate {
                timestamp,
                component_type_id,
                entity_id,
                data,
            } => self.handle_component_update(*timestamp, *component_type_id, *entity_id, data),
            Packet::EntityComponentListRequest {
                request_id,
                component_type_id,
                ..
            } => self.handle_component_list(*request_id, *component_type_id),
            Packet::EntityComponentTypeSubscribeRequest {
                request_id,
                component_type_id,
                ..
            } => self.handle_component_subscribe(*request_id, *component_type_id),
            Packet::EntityComponentTypeUnsubscribeRequest {
                request_id,
                component_type_id,
                ..
            } => self.handle_component_unsubscribe(*request_id, *component_type_id),
            Packet::ReceiptRequest {
                request_id,
                receipt,
                hash,
                signature,
                ..
            } => {
                self.handle_receipt(*request_id, receipt, hash, signature);
                Ok(())
            }
            // Anything else is either server-originated or module territory.
            _ => Ok(()),
        }
    }

    /// Offers the message to every module, gated on membership. A `Skip`
    /// means the module did not care; anything else tears the connection
    /// down.
    pub fn handle_with_modules(&mut self, packet: &Packet) -> Result<(), HandlerError> {
        if self.current_session.is_none() || self.current_participant.is_none() {
            return Ok(());
        }

        let outbox = self.outbox.clone();
        for module in self.modules.iter_mut() {
            match module.handle_msg(&outbox, packet) {
                Ok(()) | Err(ModuleError::Skip) => {}
                Err(ModuleError::Fatal(reason)) => {
                    return Err(HandlerError::Module {
                        module: module.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }

    /// Sends the periodic clock message. Returns false when the outbox is
    /// gone and the connection should be torn down.
    pub fn send_sync_clock(&self) -> bool {
        self.outbox.send_packet(&Packet::SyncClock {
            timestamp: Timestamp::now(),
        })
    }

    pub fn handle_disconnect(&mut self) {
        if self.current_participant.is_some() {
            self.leave_session();
        }
    }

    fn respond_error(&self, request_id: u32, code: ErrorCode) {
        self.outbox.send_packet(&Packet::ErrorResponse {
            timestamp: Timestamp::now(),
            request_id,
            code,
        });
    }

    fn require_joined(
        &self,
        msg_type: &'static str,
    ) -> Result<(Arc<Session>, Arc<Participant>), HandlerError> {
        match (&self.current_session, &self.current_participant) {
            (Some(session), Some(participant)) => {
                Ok((Arc::clone(session), Arc::clone(participant)))
            }
            _ => Err(HandlerError::NotJoined { msg_type }),
        }
    }

    fn handle_ping(&self, request_id: u32) {
        self.outbox.send_packet(&Packet::PingResponse {
            timestamp: Timestamp::now(),
            request_id,
        });
    }

    fn handle_ping_response(&mut self, request_id: u32) -> Result<(), HandlerError> {
        let Some(probe) = self.latency_probe.as_mut() else {
            log::debug!("ping response {} outside a latency probe", request_id);
            return Ok(());
        };

        let outbox = self.outbox.clone();
        match probe.handle_ping_response(request_id, &outbox, &self.env.signing_key)? {
            ProbeStatus::Completed => {
                self.latency_probe = None;
                Ok(())
            }
            ProbeStatus::InFlight => Ok(()),
        }
    }

    fn handle_signed_latency(&mut self, request_id: u32, iteration_count: u32, wallet_address: &str) {
        if !(latency::MIN_ITERATIONS..=latency::MAX_ITERATIONS).contains(&iteration_count) {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return;
        }

        let Some(session) = self.current_session.as_ref() else {
            self.respond_error(request_id, ErrorCode::Unauthorized);
            return;
        };

        if wallet_address.is_empty() {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return;
        }

        let session_id = self.env.sessions.global_session_id(session.id);
        self.latency_probe = Some(SignedLatencyProbe::start(
            request_id,
            iteration_count,
            session_id,
            self.client_id.clone(),
            wallet_address.to_string(),
            &self.outbox,
        ));
    }

    fn handle_participant_join(
        &mut self,
        origin_timestamp: Timestamp,
        request_id: u32,
        session_id: &str,
    ) {
        if let Some(current) = &self.current_session {
            if self.env.sessions.global_session_id(current.id) == session_id {
                self.respond_error(request_id, ErrorCode::SessionAlreadyJoined);
                return;
            }
        }

        if self.current_participant.is_some() {
            self.leave_session();
        }

        let session = match self.env.sessions.get_by_global_id(session_id) {
            Some(session) => session,
            None if !session_id.is_empty() => {
                self.respond_error(request_id, ErrorCode::NotFound);
                return;
            }
            None => {
                let session = Session::new(
                    self.env.sessions.new_id(),
                    self.app_key.clone(),
                    self.env.frame_duration,
                );
                self.env.sessions.add(Arc::clone(&session));
                session.spawn_frame_loop();
                session
            }
        };

        let participant = Arc::new(Participant::new(
            session.new_participant_id(),
            self.outbox.clone(),
        ));
        session.add_participant(Arc::clone(&participant));

        let scheduler = Arc::clone(&self.scheduler);
        self.frame_handle = Some(session.handle_frame(Box::new(move || scheduler.flush_frame())));

        self.outbox.send_packet(&Packet::ParticipantJoinResponse {
            timestamp: Timestamp::now(),
            request_id,
            session_id: self.env.sessions.global_session_id(session.id),
            session_uuid: session.uuid.clone(),
            participant_id: participant.id,
        });

        self.current_session = Some(Arc::clone(&session));
        self.current_participant = Some(Arc::clone(&participant));

        if !self.env.flags.is_set(Flag::DisableSessionState) {
            self.outbox.send_packet(&Packet::SessionState {
                timestamp: Timestamp::now(),
                participants: session
                    .participants()
                    .iter()
                    .map(|p| p.to_state())
                    .collect(),
                entities: session.entities().iter().map(|e| e.to_state()).collect(),
                entity_components: session.components().list_all(),
            });
        }

        if !self.env.flags.is_set(Flag::DisableParticipantJoinBroadcast) {
            session.broadcast(
                participant.id,
                &Packet::ParticipantJoinBroadcast {
                    timestamp: Timestamp::now(),
                    origin_timestamp,
                    participant_id: participant.id,
                },
            );
        }

        for module in self.modules.iter_mut() {
            module.init(&session, &participant);
        }
    }

    fn handle_entity_add(
        &mut self,
        origin_timestamp: Timestamp,
        request_id: u32,
        pose: Option<Pose>,
        persist: bool,
        flag: EntityFlag,
    ) -> Result<(), HandlerError> {
        let (session, participant) = self.require_joined("entity_add_request")?;

        let entity = Arc::new(crate::entity::Entity::new(
            session.new_entity_id(),
            participant.id,
            persist,
            flag,
        ));
        if let Some(pose) = pose {
            entity.set_pose(pose);
        }

        session.add_entity(Arc::clone(&entity));
        participant.add_entity(entity.id);

        let now = Timestamp::now();
        self.outbox.send_packet(&Packet::EntityAddResponse {
            timestamp: now,
            request_id,
            entity_id: entity.id,
        });

        if !self.env.flags.is_set(Flag::DisableEntityAddBroadcast) {
            session.broadcast(
                participant.id,
                &Packet::EntityAddBroadcast {
                    timestamp: now,
                    origin_timestamp,
                    entity: entity.to_state(),
                },
            );
        }
        Ok(())
    }

    fn handle_entity_delete(
        &mut self,
        origin_timestamp: Timestamp,
        request_id: u32,
        entity_id: u32,
    ) -> Result<(), HandlerError> {
        let (session, participant) = self.require_joined("entity_delete_request")?;

        let Some(entity) = session.entity_by_id(entity_id) else {
            self.respond_error(request_id, ErrorCode::NotFound);
            return Ok(());
        };

        if entity.participant_id != participant.id {
            self.respond_error(request_id, ErrorCode::Unauthorized);
            return Ok(());
        }

        let now = Timestamp::now();
        session.components().delete_by_entity(entity.id);
        session.remove_entity(entity.id);
        participant.remove_entity(entity.id);

        self.outbox.send_packet(&Packet::EntityDeleteResponse {
            timestamp: now,
            request_id,
        });

        if !self.env.flags.is_set(Flag::DisableEntityDeleteBroadcast) {
            session.broadcast(
                participant.id,
                &Packet::EntityDeleteBroadcast {
                    timestamp: now,
                    origin_timestamp,
                    entity_id: entity.id,
                },
            );
        }
        Ok(())
    }

    fn handle_entity_update_pose(
        &mut self,
        origin_timestamp: Timestamp,
        entity_id: u32,
        pose: Pose,
    ) -> Result<(), HandlerError> {
        let (session, participant) = self.require_joined("entity_update_pose")?;

        // Pose updates come in bursts; unknown or foreign entities are
        // dropped without feedback.
        let Some(entity) = session.entity_by_id(entity_id) else {
            log::debug!("pose update for unknown entity {}", entity_id);
            return Ok(());
        };
        if entity.participant_id != participant.id {
            log::debug!(
                "participant {} ignored pose update on foreign entity {}",
                participant.id,
                entity_id
            );
            return Ok(());
        }

        entity.set_pose(pose);

        if !self.env.flags.is_set(Flag::DisableEntityUpdatePoseBroadcast) {
            session.broadcast(
                participant.id,
                &Packet::EntityUpdatePoseBroadcast {
                    timestamp: Timestamp::now(),
                    origin_timestamp,
                    entity_id: entity.id,
                    pose: entity.pose(),
                },
            );
        }
        Ok(())
    }

    fn handle_custom_message(
        &mut self,
        origin_timestamp: Timestamp,
        participant_ids: &[u32],
        body: &[u8],
    ) -> Result<(), HandlerError> {
        let (session, participant) = self.require_joined("custom_message")?;

        if body.len() > CUSTOM_MESSAGE_MAX_SIZE {
            self.respond_error(0, ErrorCode::TooLarge);
            return Ok(());
        }

        if self.env.flags.is_set(Flag::DisableCustomMessageBroadcast) {
            return Ok(());
        }

        let broadcast = Packet::CustomMessageBroadcast {
            timestamp: Timestamp::now(),
            origin_timestamp,
            participant_id: participant.id,
            body: body.to_vec(),
        };

        if participant_ids.is_empty() {
            session.broadcast(participant.id, &broadcast);
        } else {
            session.broadcast_to(participant.id, &broadcast, participant_ids);
        }
        Ok(())
    }

    fn handle_component_type_add(
        &mut self,
        request_id: u32,
        name: &str,
    ) -> Result<(), HandlerError> {
        if name.is_empty() {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, _) = self.require_joined("entity_component_type_add_request")?;

        self.outbox
            .send_packet(&Packet::EntityComponentTypeAddResponse {
                timestamp: Timestamp::now(),
                request_id,
                component_type_id: session.components().register_type(name),
            });
        Ok(())
    }

    fn handle_component_type_get_name(
        &mut self,
        request_id: u32,
        component_type_id: u32,
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, _) = self.require_joined("entity_component_type_get_name_request")?;

        match session.components().type_name(component_type_id) {
            Ok(name) => self
                .outbox
                .send_packet(&Packet::EntityComponentTypeGetNameResponse {
                    timestamp: Timestamp::now(),
                    request_id,
                    name,
                }),
            Err(_) => {
                self.respond_error(request_id, ErrorCode::NotFound);
                return Ok(());
            }
        };
        Ok(())
    }

    fn handle_component_type_get_id(
        &mut self,
        request_id: u32,
        name: &str,
    ) -> Result<(), HandlerError> {
        if name.is_empty() {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, _) = self.require_joined("entity_component_type_get_id_request")?;

        match session.components().type_id(name) {
            Ok(component_type_id) => {
                self.outbox
                    .send_packet(&Packet::EntityComponentTypeGetIdResponse {
                        timestamp: Timestamp::now(),
                        request_id,
                        component_type_id,
                    })
            }
            Err(_) => {
                self.respond_error(request_id, ErrorCode::NotFound);
                return Ok(());
            }
        };
        Ok(())
    }

    fn handle_component_add(
        &mut self,
        origin_timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
        entity_id: u32,
        data: &[u8],
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 || entity_id == 0 {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, participant) = self.require_joined("entity_component_add_request")?;

        let Some(entity) = session.entity_by_id(entity_id) else {
            self.respond_error(request_id, ErrorCode::NotFound);
            return Ok(());
        };

        let component = EntityComponent {
            component_type_id,
            entity_id: entity.id,
            data: data.to_vec(),
        };

        if let Err(err) = session.components().add(component.clone()) {
            let code = match err {
                crate::component::ComponentError::AlreadyExists => ErrorCode::Conflict,
                _ => ErrorCode::NotFound,
            };
            self.respond_error(request_id, code);
            return Ok(());
        }

        let now = Timestamp::now();
        self.outbox.send_packet(&Packet::EntityComponentAddResponse {
            timestamp: now,
            request_id,
        });

        if !self
            .env
            .flags
            .is_set(Flag::DisableEntityComponentAddBroadcast)
        {
            session.components().notify(component_type_id, |subscribers| {
                session.broadcast_to(
                    participant.id,
                    &Packet::EntityComponentAddBroadcast {
                        timestamp: now,
                        origin_timestamp,
                        component: component.clone(),
                    },
                    subscribers,
                );
            });
        }
        Ok(())
    }

    fn handle_component_delete(
        &mut self,
        origin_timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
        entity_id: u32,
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 || entity_id == 0 {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, participant) = self.require_joined("entity_component_delete_request")?;

        let Some(entity) = session.entity_by_id(entity_id) else {
            self.respond_error(request_id, ErrorCode::NotFound);
            return Ok(());
        };

        if !session.components().delete(component_type_id, entity.id) {
            self.respond_error(request_id, ErrorCode::NotFound);
            return Ok(());
        }

        // Subscribers learn about the deletion before the caller gets its
        // acknowledgement.
        if !self
            .env
            .flags
            .is_set(Flag::DisableEntityComponentDeleteBroadcast)
        {
            session.components().notify(component_type_id, |subscribers| {
                session.broadcast_to(
                    participant.id,
                    &Packet::EntityComponentDeleteBroadcast {
                        timestamp: Timestamp::now(),
                        origin_timestamp,
                        component: EntityComponent {
                            component_type_id,
                            entity_id: entity.id,
                            data: Vec::new(),
                        },
                    },
                    subscribers,
                );
            });
        }

        self.outbox
            .send_packet(&Packet::EntityComponentDeleteResponse {
                timestamp: Timestamp::now(),
                request_id,
            });
        Ok(())
    }

    fn handle_component_update(
        &mut self,
        origin_timestamp: Timestamp,
        component_type_id: u32,
        entity_id: u32,
        data: &[u8],
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 || entity_id == 0 {
            return Ok(());
        }

        let (session, participant) = self.require_joined("entity_component_update")?;

        if session.entity_by_id(entity_id).is_none() {
            return Ok(());
        }

        let component = EntityComponent {
            component_type_id,
            entity_id,
            data: data.to_vec(),
        };

        if let Err(err) = session.components().update(component.clone()) {
            log::debug!(
                "ignoring update for missing component ({}, {}): {}",
                component_type_id,
                entity_id,
                err
            );
            return Ok(());
        }

        if !self
            .env
            .flags
            .is_set(Flag::DisableEntityComponentUpdateBroadcast)
        {
            session.components().notify(component_type_id, |subscribers| {
                session.broadcast_to(
                    participant.id,
                    &Packet::EntityComponentUpdateBroadcast {
                        timestamp: Timestamp::now(),
                        origin_timestamp,
                        component: component.clone(),
                    },
                    subscribers,
                );
            });
        }
        Ok(())
    }

    fn handle_component_list(
        &mut self,
        request_id: u32,
        component_type_id: u32,
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, _) = self.require_joined("entity_component_list_request")?;

        self.outbox
            .send_packet(&Packet::EntityComponentListResponse {
                timestamp: Timestamp::now(),
                request_id,
                components: session.components().list(component_type_id),
            });
        Ok(())
    }

    fn handle_component_subscribe(
        &mut self,
        request_id: u32,
        component_type_id: u32,
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, participant) = self.require_joined("entity_component_subscribe_request")?;

        if session
            .components()
            .subscribe(component_type_id, participant.id)
            .is_err()
        {
            self.respond_error(request_id, ErrorCode::NotFound);
            return Ok(());
        }

        self.outbox
            .send_packet(&Packet::EntityComponentTypeSubscribeResponse {
                timestamp: Timestamp::now(),
                request_id,
            });
        Ok(())
    }

    fn handle_component_unsubscribe(
        &mut self,
        request_id: u32,
        component_type_id: u32,
    ) -> Result<(), HandlerError> {
        if component_type_id == 0 {
            self.respond_error(request_id, ErrorCode::BadRequest);
            return Ok(());
        }

        let (session, participant) = self.require_joined("entity_component_unsubscribe_request")?;

        session
            .components()
            .unsubscribe(component_type_id, participant.id);

        self.outbox
            .send_packet(&Packet::EntityComponentTypeUnsubscribeResponse {
                timestamp: Timestamp::now(),
                request_id,
            });
        Ok(())
    }

    fn handle_receipt(&mut self, request_id: u32, receipt: &[u8], hash: &[u8], signature: &[u8]) {
        if receipt.is_empty() || hash.is_empty() || signature.is_empty() {
            log::warn!("zero length receipt value from {}", self.client_id);
            self.respond_error(request_id, ErrorCode::BadRequest);
            return;
        }

        let payload = ReceiptPayload {
            receipt: receipt.to_vec(),
            hash: hash.to_vec(),
            signature: signature.to_vec(),
        };

        // The enqueue never blocks; a full channel is the busy signal.
        match self.env.receipts.try_send(payload) {
            Ok(()) => self.outbox.send_packet(&Packet::ReceiptResponse {
                timestamp: Timestamp::now(),
                request_id,
            }),
            Err(_) => {
                log::warn!("receipt channel full, discarding receipt");
                self.respond_error(request_id, ErrorCode::ServerTooBusy);
                return;
            }
        };
    }

    /// Tears down the current membership: module cleanup, subscription and
    /// ephemeral-entity purging, frame handler cancellation, participant
    /// removal and, for the last participant, session removal.
    fn leave_session(&mut self) {
        let (Some(session), Some(participant)) =
            (self.current_session.take(), self.current_participant.take())
        else {
            return;
        };

        for module in self.modules.iter_mut() {
            module.handle_disconnect();
        }

        session.components().unsubscribe_all(participant.id);

        let now = Timestamp::now();
        for entity_id in participant.entity_ids() {
            let Some(entity) = session.entity_by_id(entity_id) else {
                continue;
            };
            if entity.persist {
                continue;
            }

            session.components().delete_by_entity(entity_id);
            session.remove_entity(entity_id);

            if !self.env.flags.is_set(Flag::DisableEntityDeleteBroadcast) {
                session.broadcast(
                    participant.id,
                    &Packet::EntityDeleteBroadcast {
                        timestamp: now,
                        origin_timestamp: now,
                        entity_id,
                    },
                );
            }
        }

        if let Some(handle) = self.frame_handle.take() {
            handle.cancel();
        }
        session.remove_participant(participant.id);

        if !self
            .env
            .flags
            .is_set(Flag::DisableParticipantLeaveBroadcast)
        {
            session.broadcast(
                participant.id,
                &Packet::ParticipantLeaveBroadcast {
                    timestamp: now,
                    origin_timestamp: now,
                    participant_id: participant.id,
                },
            );
        }

        if session.participant_count() == 0 {
            self.env.sessions.remove(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signing_key_from_hex;
    use crate::modules::dagaz::DagazModule;
    use crate::modules::odal::OdalModule;
    use crate::modules::vikja::VikjaModule;
    use crate::session::DefaultDiscoveryService;
    use skein_shared::decode_packet;
    use tokio::sync::mpsc::Receiver;

    const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    struct TestEnv {
        env: HandlerEnv,
        _receipt_rx: Receiver<ReceiptPayload>,
    }

    impl TestEnv {
        fn new() -> Self {
            Self::with_receipt_capacity(crate::receipt::RECEIPT_CHAN_SIZE)
        }

        fn with_receipt_capacity(capacity: usize) -> Self {
            let (receipts, receipt_rx) = mpsc::channel(capacity);
            Self {
                env: HandlerEnv {
                    sessions: Arc::new(SessionStore::new(Arc::new(DefaultDiscoveryService))),
                    flags: Arc::new(FeatureFlags::default()),
                    receipts,
                    signing_key: Arc::new(signing_key_from_hex(TEST_KEY).unwrap()),
                    frame_duration: Duration::from_millis(15),
                },
                _receipt_rx: receipt_rx,
            }
        }

        fn client(&self, client_id: &str) -> TestClient {
            let (outbox, rx) = Outbox::channel();
            let (scheduler, _ready) = Scheduler::new();
            let modules: Vec<Box<dyn Module>> = vec![
                Box::new(VikjaModule::new()),
                Box::new(OdalModule::new()),
                Box::new(DagazModule::new()),
            ];
            TestClient {
                handler: RealtimeHandler::new(
                    self.env.clone(),
                    modules,
                    scheduler,
                    outbox,
                    client_id.to_string(),
                    String::new(),
                ),
                rx,
            }
        }
    }

    struct TestClient {
        handler: RealtimeHandler,
        rx: Receiver<Vec<u8>>,
    }

    impl TestClient {
        fn handle(&mut self, packet: Packet) {
            self.handler.handle_packet(&packet).unwrap();
            self.handler.handle_with_modules(&packet).unwrap();
        }

        fn recv(&mut self) -> Packet {
            decode_packet(&self.rx.try_recv().expect("a packet was sent")).unwrap()
        }

        fn no_more_packets(&mut self) -> bool {
            self.rx.try_recv().is_err()
        }

        fn join(&mut self, request_id: u32, session_id: &str) -> (String, u32) {
            self.handle(Packet::ParticipantJoinRequest {
                timestamp: Timestamp::now(),
                request_id,
                session_id: session_id.to_string(),
            });

            let (session_id, participant_id) = match self.recv() {
                Packet::ParticipantJoinResponse {
                    request_id: echoed,
                    session_id,
                    participant_id,
                    ..
                } => {
                    assert_eq!(echoed, request_id);
                    (session_id, participant_id)
                }
                other => panic!("expected join response, got {}", other.kind()),
            };

            // SessionState follows, then the module state snapshots.
            assert!(matches!(self.recv(), Packet::SessionState { .. }));
            assert!(matches!(self.recv(), Packet::VikjaState { .. }));
            assert!(matches!(self.recv(), Packet::OdalState { .. }));

            (session_id, participant_id)
        }

        fn add_entity(&mut self, request_id: u32, persist: bool) -> u32 {
            self.handle(Packet::EntityAddRequest {
                timestamp: Timestamp::now(),
                request_id,
                pose: None,
                persist,
                flag: EntityFlag::None,
            });
            match self.recv() {
                Packet::EntityAddResponse { entity_id, .. } => entity_id,
                other => panic!("expected entity add response, got {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn test_ping_echoes_request_id() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");

        client.handle(Packet::PingRequest {
            timestamp: Timestamp::now(),
            request_id: 42,
        });
        assert!(matches!(
            client.recv(),
            Packet::PingResponse { request_id: 42, .. }
        ));
    }

    #[tokio::test]
    async fn test_join_creates_session() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");

        client.handle(Packet::ParticipantJoinRequest {
            timestamp: Timestamp::now(),
            request_id: 1,
            session_id: String::new(),
        });

        match client.recv() {
            Packet::ParticipantJoinResponse {
                request_id,
                session_id,
                session_uuid,
                participant_id,
                ..
            } => {
                assert_eq!(request_id, 1);
                assert_eq!(session_id, "tedx1");
                assert!(!session_uuid.is_empty());
                assert_eq!(participant_id, 1);
            }
            other => panic!("expected join response, got {}", other.kind()),
        }

        match client.recv() {
            Packet::SessionState {
                participants,
                entities,
                ..
            } => {
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].id, 1);
                assert!(entities.is_empty());
            }
            other => panic!("expected session state, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_second_joiner_sees_both_participants() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");

        let mut b = env.client("client-b");
        let join_ts = Timestamp::now();
        b.handle(Packet::ParticipantJoinRequest {
            timestamp: join_ts,
            request_id: 2,
            session_id: session_id.clone(),
        });

        match b.recv() {
            Packet::ParticipantJoinResponse {
                session_id: joined,
                participant_id,
                ..
            } => {
                assert_eq!(joined, session_id);
                assert_eq!(participant_id, 2);
            }
            other => panic!("expected join response, got {}", other.kind()),
        }

        match b.recv() {
            Packet::SessionState { participants, .. } => {
                assert_eq!(participants.len(), 2);
            }
            other => panic!("expected session state, got {}", other.kind()),
        }

        // The first client observes the join with the request's timestamp as
        // origin.
        match a.recv() {
            Packet::ParticipantJoinBroadcast {
                participant_id,
                origin_timestamp,
                ..
            } => {
                assert_eq!(participant_id, 2);
                assert_eq!(origin_timestamp, join_ts);
            }
            other => panic!("expected join broadcast, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_rejoining_the_same_session_fails() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");
        let (session_id, _) = client.join(1, "");

        client.handle(Packet::ParticipantJoinRequest {
            timestamp: Timestamp::now(),
            request_id: 2,
            session_id,
        });
        assert!(matches!(
            client.recv(),
            Packet::ErrorResponse {
                request_id: 2,
                code: ErrorCode::SessionAlreadyJoined,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_joining_unknown_session_fails() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");

        client.handle(Packet::ParticipantJoinRequest {
            timestamp: Timestamp::now(),
            request_id: 3,
            session_id: "tedxdead".to_string(),
        });
        assert!(matches!(
            client.recv(),
            Packet::ErrorResponse {
                request_id: 3,
                code: ErrorCode::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_entity_delete() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");
        let entity_id = a.add_entity(2, false);
        assert_eq!(entity_id, 1);

        let mut b = env.client("client-b");
        b.join(3, &session_id);
        // Drain A's broadcast for B's join.
        a.recv();

        b.handle(Packet::EntityDeleteRequest {
            timestamp: Timestamp::now(),
            request_id: 4,
            entity_id,
        });
        assert!(matches!(
            b.recv(),
            Packet::ErrorResponse {
                request_id: 4,
                code: ErrorCode::Unauthorized,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_foreign_pose_update_is_silently_dropped() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");
        let entity_id = a.add_entity(2, false);

        let mut b = env.client("client-b");
        b.join(3, &session_id);
        a.recv();

        b.handle(Packet::EntityUpdatePose {
            timestamp: Timestamp::now(),
            entity_id,
            pose: Pose {
                px: 9.0,
                ..Pose::default()
            },
        });

        assert!(b.no_more_packets());
        assert!(a.no_more_packets());
    }

    #[tokio::test]
    async fn test_custom_message_too_large() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");
        let mut b = env.client("client-b");
        b.join(2, &session_id);
        a.recv();

        a.handle(Packet::CustomMessage {
            timestamp: Timestamp::now(),
            participant_ids: Vec::new(),
            body: vec![0u8; CUSTOM_MESSAGE_MAX_SIZE + 1],
        });

        assert!(matches!(
            a.recv(),
            Packet::ErrorResponse {
                code: ErrorCode::TooLarge,
                ..
            }
        ));
        // No broadcast reached the peer.
        assert!(b.no_more_packets());
    }

    #[tokio::test]
    async fn test_custom_message_targets_named_participants() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, a_id) = a.join(1, "");
        let mut b = env.client("client-b");
        let (_, b_id) = b.join(2, &session_id);
        a.recv();

        b.handle(Packet::CustomMessage {
            timestamp: Timestamp::now(),
            participant_ids: vec![a_id, a_id, b_id],
            body: b"hello".to_vec(),
        });

        match a.recv() {
            Packet::CustomMessageBroadcast {
                participant_id,
                body,
                ..
            } => {
                assert_eq!(participant_id, b_id);
                assert_eq!(body, b"hello");
            }
            other => panic!("expected custom message broadcast, got {}", other.kind()),
        }
        assert!(a.no_more_packets());
        // The sender never hears its own message back.
        assert!(b.no_more_packets());
    }

    #[tokio::test]
    async fn test_disconnect_cleanup_preserves_persistent_entities() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");

        let mut b = env.client("client-b");
        let (_, b_id) = b.join(2, &session_id);
        a.recv();

        let ephemeral = b.add_entity(3, false);
        let persistent = b.add_entity(4, true);
        // A sees both entity add broadcasts.
        a.recv();
        a.recv();

        b.handler.handle_disconnect();

        match a.recv() {
            Packet::EntityDeleteBroadcast { entity_id, .. } => assert_eq!(entity_id, ephemeral),
            other => panic!("expected entity delete broadcast, got {}", other.kind()),
        }
        match a.recv() {
            Packet::ParticipantLeaveBroadcast { participant_id, .. } => {
                assert_eq!(participant_id, b_id)
            }
            other => panic!("expected participant leave broadcast, got {}", other.kind()),
        }
        assert!(a.no_more_packets());

        // The persistent entity survived in the session.
        let session = a.handler.current_session().unwrap();
        assert!(session.entity_by_id(persistent).is_some());
        assert!(session.entity_by_id(ephemeral).is_none());
    }

    #[tokio::test]
    async fn test_last_leave_removes_the_session() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");
        let (session_id, _) = client.join(1, "");

        client.handler.handle_disconnect();
        assert!(env.env.sessions.get_by_global_id(&session_id).is_none());

        // The id is reusable: the next fresh session gets the same global id.
        let mut next = env.client("client-b");
        let (reused, _) = next.join(2, "");
        assert_eq!(reused, session_id);
    }

    #[tokio::test]
    async fn test_component_add_conflict_and_subscription_flow() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");
        let entity_id = a.add_entity(2, false);

        let mut b = env.client("client-b");
        b.join(3, &session_id);
        a.recv();

        a.handle(Packet::EntityComponentTypeAddRequest {
            timestamp: Timestamp::now(),
            request_id: 5,
            name: "transform".to_string(),
        });
        let type_id = match a.recv() {
            Packet::EntityComponentTypeAddResponse {
                component_type_id, ..
            } => component_type_id,
            other => panic!("expected type add response, got {}", other.kind()),
        };

        b.handle(Packet::EntityComponentTypeSubscribeRequest {
            timestamp: Timestamp::now(),
            request_id: 6,
            component_type_id: type_id,
        });
        assert!(matches!(
            b.recv(),
            Packet::EntityComponentTypeSubscribeResponse { request_id: 6, .. }
        ));

        a.handle(Packet::EntityComponentAddRequest {
            timestamp: Timestamp::now(),
            request_id: 7,
            component_type_id: type_id,
            entity_id,
            data: b"v1".to_vec(),
        });
        assert!(matches!(
            a.recv(),
            Packet::EntityComponentAddResponse { request_id: 7, .. }
        ));

        // The subscriber hears about it; the sender does not.
        match b.recv() {
            Packet::EntityComponentAddBroadcast { component, .. } => {
                assert_eq!(component.component_type_id, type_id);
                assert_eq!(component.entity_id, entity_id);
            }
            other => panic!("expected component add broadcast, got {}", other.kind()),
        }
        assert!(a.no_more_packets());

        // Second add on the same pair conflicts without mutating.
        a.handle(Packet::EntityComponentAddRequest {
            timestamp: Timestamp::now(),
            request_id: 8,
            component_type_id: type_id,
            entity_id,
            data: b"v2".to_vec(),
        });
        assert!(matches!(
            a.recv(),
            Packet::ErrorResponse {
                request_id: 8,
                code: ErrorCode::Conflict,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_receipt_validation_and_backpressure() {
        let env = TestEnv::with_receipt_capacity(1);
        let mut client = env.client("client-a");
        client.join(1, "");

        client.handle(Packet::ReceiptRequest {
            timestamp: Timestamp::now(),
            request_id: 2,
            receipt: Vec::new(),
            hash: vec![1],
            signature: vec![1],
        });
        assert!(matches!(
            client.recv(),
            Packet::ErrorResponse {
                request_id: 2,
                code: ErrorCode::BadRequest,
                ..
            }
        ));

        client.handle(Packet::ReceiptRequest {
            timestamp: Timestamp::now(),
            request_id: 3,
            receipt: vec![1],
            hash: vec![2],
            signature: vec![3],
        });
        assert!(matches!(
            client.recv(),
            Packet::ReceiptResponse { request_id: 3, .. }
        ));

        // Capacity one and nobody draining: the next receipt is refused.
        client.handle(Packet::ReceiptRequest {
            timestamp: Timestamp::now(),
            request_id: 4,
            receipt: vec![1],
            hash: vec![2],
            signature: vec![3],
        });
        assert!(matches!(
            client.recv(),
            Packet::ErrorResponse {
                request_id: 4,
                code: ErrorCode::ServerTooBusy,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_signed_latency_validation() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");

        // Not joined yet.
        client.handle(Packet::SignedLatencyRequest {
            timestamp: Timestamp::now(),
            request_id: 1,
            iteration_count: 10,
            wallet_address: "0x123456789".to_string(),
        });
        assert!(matches!(
            client.recv(),
            Packet::ErrorResponse {
                request_id: 1,
                code: ErrorCode::Unauthorized,
                ..
            }
        ));

        client.join(2, "");

        for (request_id, iteration_count) in [(3u32, 1u32), (4, 100)] {
            client.handle(Packet::SignedLatencyRequest {
                timestamp: Timestamp::now(),
                request_id,
                iteration_count,
                wallet_address: "0x123456789".to_string(),
            });
            match client.recv() {
                Packet::ErrorResponse {
                    request_id: echoed,
                    code,
                    ..
                } => {
                    assert_eq!(echoed, request_id);
                    assert_eq!(code, ErrorCode::BadRequest);
                }
                other => panic!("expected error response, got {}", other.kind()),
            }
        }

        client.handle(Packet::SignedLatencyRequest {
            timestamp: Timestamp::now(),
            request_id: 5,
            iteration_count: 10,
            wallet_address: String::new(),
        });
        assert!(matches!(
            client.recv(),
            Packet::ErrorResponse {
                request_id: 5,
                code: ErrorCode::BadRequest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_signed_latency_probe_end_to_end() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");
        client.join(1, "");

        client.handle(Packet::SignedLatencyRequest {
            timestamp: Timestamp::now(),
            request_id: 2,
            iteration_count: 3,
            wallet_address: "0x123456789".to_string(),
        });

        // Answer server pings until the signed aggregate arrives.
        for _ in 0..3 {
            match client.recv() {
                Packet::PingRequest { request_id, .. } => {
                    client.handle(Packet::PingResponse {
                        timestamp: Timestamp::now(),
                        request_id,
                    });
                }
                other => panic!("expected ping request, got {}", other.kind()),
            }
        }

        match client.recv() {
            Packet::SignedLatencyResponse {
                request_id, data, ..
            } => {
                assert_eq!(request_id, 2);
                assert_eq!(data.iteration_count, 3);
                assert_eq!(data.session_id, "tedx1");
                assert_eq!(data.client_id, "client-a");
                assert_eq!(data.wallet_address, "0x123456789");
            }
            other => panic!("expected signed latency response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_entity_action_flow_and_replay_protection() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");
        let entity_id = a.add_entity(2, false);

        let mut b = env.client("client-b");
        b.join(3, &session_id);
        a.recv();

        let action = |secs: u64| skein_shared::EntityAction {
            entity_id,
            name: "open".to_string(),
            data: Vec::new(),
            timestamp: Some(Timestamp { secs, nanos: 0 }),
        };

        a.handle(Packet::EntityActionRequest {
            timestamp: Timestamp::now(),
            request_id: 5,
            entity_action: Some(action(100)),
        });
        assert!(matches!(
            a.recv(),
            Packet::EntityActionResponse { request_id: 5, .. }
        ));
        assert!(matches!(b.recv(), Packet::EntityActionBroadcast { .. }));

        // A stale action is rejected.
        a.handle(Packet::EntityActionRequest {
            timestamp: Timestamp::now(),
            request_id: 6,
            entity_action: Some(action(50)),
        });
        assert!(matches!(
            a.recv(),
            Packet::ErrorResponse {
                request_id: 6,
                code: ErrorCode::BadRequest,
                ..
            }
        ));
        assert!(b.no_more_packets());
    }

    #[tokio::test]
    async fn test_asset_instance_owner_gating() {
        let env = TestEnv::new();
        let mut a = env.client("client-a");
        let (session_id, _) = a.join(1, "");
        let entity_id = a.add_entity(2, false);

        let mut b = env.client("client-b");
        b.join(3, &session_id);
        a.recv();

        b.handle(Packet::AssetInstanceAddRequest {
            timestamp: Timestamp::now(),
            request_id: 4,
            asset_id: "chair".to_string(),
            entity_id,
        });
        assert!(matches!(
            b.recv(),
            Packet::ErrorResponse {
                request_id: 4,
                code: ErrorCode::Unauthorized,
                ..
            }
        ));

        a.handle(Packet::AssetInstanceAddRequest {
            timestamp: Timestamp::now(),
            request_id: 5,
            asset_id: "chair".to_string(),
            entity_id,
        });
        match a.recv() {
            Packet::AssetInstanceAddResponse {
                asset_instance_id, ..
            } => assert_eq!(asset_instance_id, 1),
            other => panic!("expected asset instance response, got {}", other.kind()),
        }
        assert!(matches!(b.recv(), Packet::AssetInstanceAddBroadcast { .. }));
    }

    #[tokio::test]
    async fn test_dagaz_quad_sample_and_debug_info() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");
        client.join(1, "");

        client.handle(Packet::DagazQuadSample {
            timestamp: Timestamp::now(),
            samples: vec![skein_shared::QuadState {
                center: skein_shared::Vec3State::default(),
                extents: skein_shared::Vec3State {
                    x: 1.0,
                    y: 0.0,
                    z: 1.0,
                },
                merge_count: 0,
            }],
        });
        assert!(client.no_more_packets());

        client.handle(Packet::DagazGetDebugInfoRequest {
            timestamp: Timestamp::now(),
            request_id: 2,
        });
        match client.recv() {
            Packet::DagazGetDebugInfoResponse {
                grid_plane_count,
                grid_merge_count,
                ..
            } => {
                assert_eq!(grid_plane_count, 1);
                assert_eq!(grid_merge_count, 0);
            }
            other => panic!("expected debug info response, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_unjoined_frame_mutation_terminates() {
        let env = TestEnv::new();
        let mut client = env.client("client-a");

        let result = client.handler.handle_packet(&Packet::EntityUpdatePose {
            timestamp: Timestamp::now(),
            entity_id: 1,
            pose: Pose::default(),
        });
        assert!(matches!(result, Err(HandlerError::NotJoined { .. })));
    }
}
