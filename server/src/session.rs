//! Sessions, the global session registry and the discovery-service seam.

use crate::component::EntityComponentStore;
use crate::entity::Entity;
use crate::id::IdAllocator;
use crate::metrics;
use crate::modules::{dagaz, odal, vikja};
use crate::participant::Participant;
use parking_lot::{Mutex, RwLock};
use skein_shared::{encode_packet, Packet};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Per-session state of every extension module, composed at session
/// construction. Each container guards its own data.
#[derive(Default)]
pub struct ModuleStates {
    pub vikja: vikja::State,
    pub odal: odal::State,
    pub dagaz: dagaz::State,
}

pub type FrameFn = Box<dyn Fn() + Send + Sync>;

/// A shared-state container for participants exchanging realtime messages.
///
/// Lifetime is bounded by the first participant join and the last leave. The
/// lock nesting order is session maps, then entity, then the component store
/// (data before subscriptions).
pub struct Session {
    pub id: u32,
    pub uuid: String,
    pub app_key: String,

    participant_ids: IdAllocator,
    participants: RwLock<HashMap<u32, Arc<Participant>>>,

    entity_ids: IdAllocator,
    entities: RwLock<HashMap<u32, Arc<Entity>>>,

    pub modules: ModuleStates,
    components: EntityComponentStore,

    frame_duration: Duration,
    frame_handler_ids: IdAllocator,
    frame_handlers: RwLock<HashMap<u32, FrameFn>>,
    frame_started: AtomicBool,
    frame_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Session {
    pub fn new(id: u32, app_key: String, frame_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            uuid: uuid::Uuid::new_v4().to_string(),
            app_key,
            participant_ids: IdAllocator::new(),
            participants: RwLock::new(HashMap::new()),
            entity_ids: IdAllocator::new(),
            entities: RwLock::new(HashMap::new()),
            modules: ModuleStates::default(),
            components: EntityComponentStore::new(),
            frame_duration,
            frame_handler_ids: IdAllocator::new(),
            frame_handlers: RwLock::new(HashMap::new()),
            frame_started: AtomicBool::new(false),
            frame_stop: Mutex::new(None),
        })
    }

    pub fn new_participant_id(&self) -> u32 {
        self.participant_ids.next()
    }

    pub fn add_participant(&self, participant: Arc<Participant>) {
        self.participants.write().insert(participant.id, participant);
    }

    pub fn remove_participant(&self, participant_id: u32) {
        self.participants.write().remove(&participant_id);
    }

    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants.read().values().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.read().len()
    }

    pub fn new_entity_id(&self) -> u32 {
        self.entity_ids.next()
    }

    pub fn add_entity(&self, entity: Arc<Entity>) {
        self.entities.write().insert(entity.id, entity);
    }

    /// Removes the entity and marks its id reusable.
    pub fn remove_entity(&self, entity_id: u32) {
        if self.entities.write().remove(&entity_id).is_some() {
            self.entity_ids.reuse(entity_id);
        }
    }

    pub fn entity_by_id(&self, entity_id: u32) -> Option<Arc<Entity>> {
        self.entities.read().get(&entity_id).cloned()
    }

    pub fn entities(&self) -> Vec<Arc<Entity>> {
        self.entities.read().values().cloned().collect()
    }

    pub fn components(&self) -> &EntityComponentStore {
        &self.components
    }

    /// Encodes the message once and delivers it to every participant except
    /// the sender. Encoding failures drop the message; a full recipient
    /// outbox never blocks the others.
    pub fn broadcast(&self, sender_id: u32, packet: &Packet) {
        let frame = match encode_packet(packet) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("encoding broadcast {} failed: {}", packet.kind(), err);
                return;
            }
        };

        for participant in self.participants.read().values() {
            if participant.id == sender_id {
                continue;
            }
            self.deliver(participant, frame.clone());
        }
    }

    /// Delivers to the named participants, deduplicated, sender excluded even
    /// if listed.
    pub fn broadcast_to(&self, sender_id: u32, packet: &Packet, participant_ids: &[u32]) {
        let frame = match encode_packet(packet) {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("encoding broadcast {} failed: {}", packet.kind(), err);
                return;
            }
        };

        let participants = self.participants.read();
        let mut handled = HashSet::with_capacity(participant_ids.len());
        for &id in participant_ids {
            if id == sender_id || !handled.insert(id) {
                continue;
            }
            if let Some(participant) = participants.get(&id) {
                self.deliver(participant, frame.clone());
            }
        }
    }

    fn deliver(&self, participant: &Arc<Participant>, frame: Vec<u8>) {
        if !participant.responder.try_send_frame(frame) {
            metrics::inc(&metrics::BROADCAST_DROPPED);
            log::debug!(
                "dropping broadcast frame for slow participant {}",
                participant.id
            );
        }
    }

    /// Registers a frame handler and returns its cancel handle.
    pub fn handle_frame(self: &Arc<Self>, handler: FrameFn) -> FrameHandle {
        let id = self.frame_handler_ids.next();
        self.frame_handlers.write().insert(id, handler);
        FrameHandle {
            session: Arc::clone(self),
            id,
        }
    }

    /// Runs every registered frame handler once. Invoked by the frame task
    /// each tick; handlers run synchronously under the registry read lock.
    pub fn dispatch_frame(&self) {
        for handler in self.frame_handlers.read().values() {
            handler();
        }
    }

    /// Starts the frame ticker task. Subsequent calls are no-ops.
    pub fn spawn_frame_loop(self: &Arc<Self>) {
        if self.frame_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *self.frame_stop.lock() = Some(stop_tx);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(session.frame_duration);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => session.dispatch_frame(),
                }
            }
        });
    }

    /// Stops the frame ticker. Safe to call more than once.
    pub fn close(&self) {
        if let Some(stop_tx) = self.frame_stop.lock().take() {
            let _ = stop_tx.send(());
        }
    }
}

/// Cancel handle returned by [`Session::handle_frame`].
pub struct FrameHandle {
    session: Arc<Session>,
    id: u32,
}

impl FrameHandle {
    pub fn cancel(self) {
        self.session.frame_handlers.write().remove(&self.id);
        self.session.frame_handler_ids.reuse(self.id);
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing auth token")]
    MissingToken,
    #[error("invalid auth token")]
    InvalidToken,
}

/// What a verified token tells us about the client.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub app_key: String,
}

/// The discovery service this server registers with. Only the surface the
/// core needs is modelled here; the production client lives elsewhere.
pub trait DiscoveryService: Send + Sync {
    /// The id attributed to this server by the discovery service.
    fn server_id(&self) -> String;

    /// Validates a client auth token and extracts its app key.
    fn verify_user_auth(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Placeholder used in tests and when running unpaired.
#[derive(Debug, Default)]
pub struct DefaultDiscoveryService;

impl DiscoveryService for DefaultDiscoveryService {
    fn server_id(&self) -> String {
        "ted".to_string()
    }

    fn verify_user_auth(&self, _token: &str) -> Result<AuthContext, AuthError> {
        Ok(AuthContext::default())
    }
}

/// Global session registry addressable by `<server_id>x<hex(session_id)>`.
pub struct SessionStore {
    discovery: Arc<dyn DiscoveryService>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    ids: IdAllocator,
}

impl SessionStore {
    pub fn new(discovery: Arc<dyn DiscoveryService>) -> Self {
        Self {
            discovery,
            sessions: RwLock::new(HashMap::new()),
            ids: IdAllocator::new(),
        }
    }

    pub fn discovery(&self) -> &Arc<dyn DiscoveryService> {
        &self.discovery
    }

    pub fn new_id(&self) -> u32 {
        self.ids.next()
    }

    pub fn add(&self, session: Arc<Session>) {
        let app_key = session.app_key.clone();
        self.sessions
            .write()
            .insert(self.global_session_id(session.id), session);

        metrics::inc(&metrics::SESSIONS_OPEN);
        metrics::inc(&metrics::SESSIONS_CREATED);
        log::debug!(
            "session registered app_key={:?} open={}",
            app_key,
            metrics::get(&metrics::SESSIONS_OPEN)
        );
    }

    /// Unregisters the session, stops its frame ticker and marks its id
    /// reusable.
    pub fn remove(&self, session: &Arc<Session>) {
        self.sessions
            .write()
            .remove(&self.global_session_id(session.id));
        session.close();
        self.ids.reuse(session.id);
        metrics::dec(&metrics::SESSIONS_OPEN);
    }

    pub fn get_by_global_id(&self, global_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(global_id).cloned()
    }

    /// Wire-level session identifier: `<server_id>x<hex(session_id)>`,
    /// lower-case hex without leading zeros.
    pub fn global_session_id(&self, session_id: u32) -> String {
        format!("{}x{:x}", self.discovery.server_id(), session_id)
    }
}
