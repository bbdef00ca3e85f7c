//! # Shared Protocol Library
//!
//! This crate contains everything the skein session server and its clients
//! must agree on: the complete message catalogue, pose and timestamp
//! representations, error codes, and the latency aggregate that gets signed
//! by the server.
//!
//! ## Wire format
//!
//! Every message is one WebSocket binary frame holding a `Packet` serialized
//! with `bincode`. The enum discriminant is the first field on the wire and
//! identifies the message type; WebSocket framing provides the length
//! delimiting. All spatial quantities are transmitted as 32-bit IEEE 754
//! floats and all timestamps as wall-clock epoch seconds plus nanoseconds.
//!
//! ## Message categories
//!
//! - **Requests** carry a `request_id` that the matching response (or
//!   `ErrorResponse`) echoes back.
//! - **Updates** (`EntityUpdatePose`, `EntityComponentUpdate`,
//!   `CustomMessage`) have no reply and are released to the session on its
//!   frame tick.
//! - **Broadcasts** are server-originated fan-outs carrying both a fresh
//!   server `timestamp` and the sender's `origin_timestamp`.
//! - **Module messages** extend the core protocol: entity actions (vikja),
//!   asset instances (odal) and the spatial partition (dagaz).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum allowed size of a `CustomMessage` body in bytes.
pub const CUSTOM_MESSAGE_MAX_SIZE: usize = 10240;

/// Wall-clock timestamp as epoch seconds plus nanoseconds.
///
/// Ordering is chronological, which the entity-action module relies on for
/// its last-writer-wins conflict rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }

    /// Total nanoseconds since the epoch. Used to derive ping request ids.
    pub fn as_nanos(&self) -> u128 {
        self.secs as u128 * 1_000_000_000 + self.nanos as u128
    }
}

/// Position and orientation of an entity: translation (px, py, pz) and a
/// rotation quaternion (rx, ry, rz, rw).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub px: f32,
    pub py: f32,
    pub pz: f32,
    pub rx: f32,
    pub ry: f32,
    pub rz: f32,
    pub rw: f32,
}

/// Error codes carried by `ErrorResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    TooLarge,
    InternalServerError,
    SessionAlreadyJoined,
    ServerTooBusy,
}

/// Behavioural flags attached to an entity at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntityFlag {
    #[default]
    None,
    EarthAnchored,
}

/// Snapshot of an entity as listed in `SessionState` and entity broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: u32,
    pub participant_id: u32,
    pub flag: EntityFlag,
    pub pose: Pose,
}

/// Snapshot of a participant as listed in `SessionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub id: u32,
}

/// A typed, named, per-entity data payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityComponent {
    pub component_type_id: u32,
    pub entity_id: u32,
    pub data: Vec<u8>,
}

/// A named action attached to an entity (vikja module). The timestamp is the
/// origin timestamp used for last-writer-wins resolution; it is optional on
/// the wire but required by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAction {
    pub entity_id: u32,
    pub name: String,
    pub data: Vec<u8>,
    pub timestamp: Option<Timestamp>,
}

/// An asset instantiated on an entity (odal module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInstance {
    pub id: u32,
    pub asset_id: String,
    pub participant_id: u32,
    pub entity_id: u32,
}

/// A point or direction in 3D space (dagaz module).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3State {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// An axis-aligned horizontal planar patch (dagaz module). `extents` are
/// half-extents around the center.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QuadState {
    pub center: Vec3State,
    pub extents: Vec3State,
    pub merge_count: u32,
}

/// A ray expressed as two points; the direction is `to - from` and hit
/// parameters are reported within `[0, 1]` along that segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RayState {
    pub from: Vec3State,
    pub to: Vec3State,
}

/// Aggregated results of one signed latency probe. This struct is marshalled
/// with bincode, hashed with Keccak-256 and signed by the server; clients
/// verify the signature against the marshalled bytes of this exact value.
///
/// All latencies are microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyData {
    pub created_at: Timestamp,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub p95: f32,
    pub last: f32,
    pub iteration_count: u32,
    pub ping_request_ids: Vec<u32>,
    pub session_id: String,
    pub client_id: String,
    pub wallet_address: String,
}

/// The complete message catalogue.
///
/// Client-originated requests carry a `request_id`; server responses echo it.
/// Broadcasts carry the sender's `origin_timestamp` next to a fresh server
/// `timestamp`. During a signed latency probe the `PingRequest`/`PingResponse`
/// pair also flows server-to-client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // === Core requests and responses ===
    PingRequest {
        timestamp: Timestamp,
        request_id: u32,
    },
    PingResponse {
        timestamp: Timestamp,
        request_id: u32,
    },
    SignedLatencyRequest {
        timestamp: Timestamp,
        request_id: u32,
        iteration_count: u32,
        wallet_address: String,
    },
    SignedLatencyResponse {
        timestamp: Timestamp,
        request_id: u32,
        data: LatencyData,
        signature: String,
    },
    ParticipantJoinRequest {
        timestamp: Timestamp,
        request_id: u32,
        session_id: String,
    },
    ParticipantJoinResponse {
        timestamp: Timestamp,
        request_id: u32,
        session_id: String,
        session_uuid: String,
        participant_id: u32,
    },
    ParticipantJoinBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        participant_id: u32,
    },
    ParticipantLeaveBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        participant_id: u32,
    },
    SessionState {
        timestamp: Timestamp,
        participants: Vec<ParticipantState>,
        entities: Vec<EntityState>,
        entity_components: Vec<EntityComponent>,
    },
    EntityAddRequest {
        timestamp: Timestamp,
        request_id: u32,
        pose: Option<Pose>,
        persist: bool,
        flag: EntityFlag,
    },
    EntityAddResponse {
        timestamp: Timestamp,
        request_id: u32,
        entity_id: u32,
    },
    EntityAddBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        entity: EntityState,
    },
    EntityDeleteRequest {
        timestamp: Timestamp,
        request_id: u32,
        entity_id: u32,
    },
    EntityDeleteResponse {
        timestamp: Timestamp,
        request_id: u32,
    },
    EntityDeleteBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        entity_id: u32,
    },
    EntityUpdatePose {
        timestamp: Timestamp,
        entity_id: u32,
        pose: Pose,
    },
    EntityUpdatePoseBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        entity_id: u32,
        pose: Pose,
    },
    CustomMessage {
        timestamp: Timestamp,
        participant_ids: Vec<u32>,
        body: Vec<u8>,
    },
    CustomMessageBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        participant_id: u32,
        body: Vec<u8>,
    },

    // === Entity components ===
    EntityComponentTypeAddRequest {
        timestamp: Timestamp,
        request_id: u32,
        name: String,
    },
    EntityComponentTypeAddResponse {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
    },
    EntityComponentTypeGetNameRequest {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
    },
    EntityComponentTypeGetNameResponse {
        timestamp: Timestamp,
        request_id: u32,
        name: String,
    },
    EntityComponentTypeGetIdRequest {
        timestamp: Timestamp,
        request_id: u32,
        name: String,
    },
    EntityComponentTypeGetIdResponse {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
    },
    EntityComponentAddRequest {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
        entity_id: u32,
        data: Vec<u8>,
    },
    EntityComponentAddResponse {
        timestamp: Timestamp,
        request_id: u32,
    },
    EntityComponentAddBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        component: EntityComponent,
    },
    EntityComponentDeleteRequest {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
        entity_id: u32,
    },
    EntityComponentDeleteResponse {
        timestamp: Timestamp,
        request_id: u32,
    },
    EntityComponentDeleteBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        component: EntityComponent,
    },
    EntityComponentUpdate {
        timestamp: Timestamp,
        component_type_id: u32,
        entity_id: u32,
        data: Vec<u8>,
    },
    EntityComponentUpdateBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        component: EntityComponent,
    },
    EntityComponentListRequest {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
    },
    EntityComponentListResponse {
        timestamp: Timestamp,
        request_id: u32,
        components: Vec<EntityComponent>,
    },
    EntityComponentTypeSubscribeRequest {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
    },
    EntityComponentTypeSubscribeResponse {
        timestamp: Timestamp,
        request_id: u32,
    },
    EntityComponentTypeUnsubscribeRequest {
        timestamp: Timestamp,
        request_id: u32,
        component_type_id: u32,
    },
    EntityComponentTypeUnsubscribeResponse {
        timestamp: Timestamp,
        request_id: u32,
    },

    // === Receipts ===
    ReceiptRequest {
        timestamp: Timestamp,
        request_id: u32,
        receipt: Vec<u8>,
        hash: Vec<u8>,
        signature: Vec<u8>,
    },
    ReceiptResponse {
        timestamp: Timestamp,
        request_id: u32,
    },

    // === Server-originated control messages ===
    SyncClock {
        timestamp: Timestamp,
    },
    ErrorResponse {
        timestamp: Timestamp,
        request_id: u32,
        code: ErrorCode,
    },

    // === Vikja: named entity actions ===
    VikjaState {
        timestamp: Timestamp,
        entity_actions: Vec<EntityAction>,
    },
    EntityActionRequest {
        timestamp: Timestamp,
        request_id: u32,
        entity_action: Option<EntityAction>,
    },
    EntityActionResponse {
        timestamp: Timestamp,
        request_id: u32,
    },
    EntityActionBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        entity_action: EntityAction,
    },

    // === Odal: asset instances ===
    OdalState {
        timestamp: Timestamp,
        asset_instances: Vec<AssetInstance>,
    },
    AssetInstanceAddRequest {
        timestamp: Timestamp,
        request_id: u32,
        asset_id: String,
        entity_id: u32,
    },
    AssetInstanceAddResponse {
        timestamp: Timestamp,
        request_id: u32,
        asset_instance_id: u32,
    },
    AssetInstanceAddBroadcast {
        timestamp: Timestamp,
        origin_timestamp: Timestamp,
        asset_instance: AssetInstance,
    },

    // === Dagaz: spatial partition ===
    DagazQuadSample {
        timestamp: Timestamp,
        samples: Vec<QuadState>,
    },
    DagazGetGroundPlaneRequest {
        timestamp: Timestamp,
        request_id: u32,
        ray: RayState,
    },
    DagazGetGroundPlaneResponse {
        timestamp: Timestamp,
        request_id: u32,
        ground: QuadState,
    },
    DagazGetRegionRequest {
        timestamp: Timestamp,
        request_id: u32,
        min: Vec3State,
        max: Vec3State,
    },
    DagazGetRegionResponse {
        timestamp: Timestamp,
        request_id: u32,
        quads: Vec<QuadState>,
    },
    DagazGetDebugInfoRequest {
        timestamp: Timestamp,
        request_id: u32,
    },
    DagazGetDebugInfoResponse {
        timestamp: Timestamp,
        request_id: u32,
        grid_resolution: u32,
        grid_row_count: u32,
        grid_col_count: u32,
        grid_plane_count: u32,
        grid_merge_count: u32,
        grid_min_point: Vec3State,
        grid_max_point: Vec3State,
        occupancy: Vec<u32>,
    },
}

impl Packet {
    /// Short stable name of the message kind, used for log summaries and
    /// per-type counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::PingRequest { .. } => "ping_request",
            Packet::PingResponse { .. } => "ping_response",
            Packet::SignedLatencyRequest { .. } => "signed_latency_request",
            Packet::SignedLatencyResponse { .. } => "signed_latency_response",
            Packet::ParticipantJoinRequest { .. } => "participant_join_request",
            Packet::ParticipantJoinResponse { .. } => "participant_join_response",
            Packet::ParticipantJoinBroadcast { .. } => "participant_join_broadcast",
            Packet::ParticipantLeaveBroadcast { .. } => "participant_leave_broadcast",
            Packet::SessionState { .. } => "session_state",
            Packet::EntityAddRequest { .. } => "entity_add_request",
            Packet::EntityAddResponse { .. } => "entity_add_response",
            Packet::EntityAddBroadcast { .. } => "entity_add_broadcast",
            Packet::EntityDeleteRequest { .. } => "entity_delete_request",
            Packet::EntityDeleteResponse { .. } => "entity_delete_response",
            Packet::EntityDeleteBroadcast { .. } => "entity_delete_broadcast",
            Packet::EntityUpdatePose { .. } => "entity_update_pose",
            Packet::EntityUpdatePoseBroadcast { .. } => "entity_update_pose_broadcast",
            Packet::CustomMessage { .. } => "custom_message",
            Packet::CustomMessageBroadcast { .. } => "custom_message_broadcast",
            Packet::EntityComponentTypeAddRequest { .. } => "entity_component_type_add_request",
            Packet::EntityComponentTypeAddResponse { .. } => "entity_component_type_add_response",
            Packet::EntityComponentTypeGetNameRequest { .. } => {
                "entity_component_type_get_name_request"
            }
            Packet::EntityComponentTypeGetNameResponse { .. } => {
                "entity_component_type_get_name_response"
            }
            Packet::EntityComponentTypeGetIdRequest { .. } => {
                "entity_component_type_get_id_request"
            }
            Packet::EntityComponentTypeGetIdResponse { .. } => {
                "entity_component_type_get_id_response"
            }
            Packet::EntityComponentAddRequest { .. } => "entity_component_add_request",
            Packet::EntityComponentAddResponse { .. } => "entity_component_add_response",
            Packet::EntityComponentAddBroadcast { .. } => "entity_component_add_broadcast",
            Packet::EntityComponentDeleteRequest { .. } => "entity_component_delete_request",
            Packet::EntityComponentDeleteResponse { .. } => "entity_component_delete_response",
            Packet::EntityComponentDeleteBroadcast { .. } => "entity_component_delete_broadcast",
            Packet::EntityComponentUpdate { .. } => "entity_component_update",
            Packet::EntityComponentUpdateBroadcast { .. } => "entity_component_update_broadcast",
            Packet::EntityComponentListRequest { .. } => "entity_component_list_request",
            Packet::EntityComponentListResponse { .. } => "entity_component_list_response",
            Packet::EntityComponentTypeSubscribeRequest { .. } => {
                "entity_component_type_subscribe_request"
            }
            Packet::EntityComponentTypeSubscribeResponse { .. } => {
                "entity_component_type_subscribe_response"
            }
            Packet::EntityComponentTypeUnsubscribeRequest { .. } => {
                "entity_component_type_unsubscribe_request"
            }
            Packet::EntityComponentTypeUnsubscribeResponse { .. } => {
                "entity_component_type_unsubscribe_response"
            }
            Packet::ReceiptRequest { .. } => "receipt_request",
            Packet::ReceiptResponse { .. } => "receipt_response",
            Packet::SyncClock { .. } => "sync_clock",
            Packet::ErrorResponse { .. } => "error_response",
            Packet::VikjaState { .. } => "vikja_state",
            Packet::EntityActionRequest { .. } => "entity_action_request",
            Packet::EntityActionResponse { .. } => "entity_action_response",
            Packet::EntityActionBroadcast { .. } => "entity_action_broadcast",
            Packet::OdalState { .. } => "odal_state",
            Packet::AssetInstanceAddRequest { .. } => "asset_instance_add_request",
            Packet::AssetInstanceAddResponse { .. } => "asset_instance_add_response",
            Packet::AssetInstanceAddBroadcast { .. } => "asset_instance_add_broadcast",
            Packet::DagazQuadSample { .. } => "dagaz_quad_sample",
            Packet::DagazGetGroundPlaneRequest { .. } => "dagaz_get_ground_plane_request",
            Packet::DagazGetGroundPlaneResponse { .. } => "dagaz_get_ground_plane_response",
            Packet::DagazGetRegionRequest { .. } => "dagaz_get_region_request",
            Packet::DagazGetRegionResponse { .. } => "dagaz_get_region_response",
            Packet::DagazGetDebugInfoRequest { .. } => "dagaz_get_debug_info_request",
            Packet::DagazGetDebugInfoResponse { .. } => "dagaz_get_debug_info_response",
        }
    }
}

/// Serializes a packet into one wire frame.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(packet)
}

/// Deserializes one wire frame into a packet.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, bincode::Error> {
    bincode::deserialize(bytes)
}
