//! Dagaz: a spatial partition of horizontal planes shared by the session.

mod grid;
mod math;

pub use grid::{DebugInfo, RegularGrid, MERGE_EPSILON};
pub use math::{intersect_ray_quad, Quad, Ray, Vec3, POSITION_EPSILON};

use crate::connection::Outbox;
use crate::modules::{Module, ModuleError};
use crate::participant::Participant;
use crate::session::Session;
use parking_lot::Mutex;
use skein_shared::{Packet, QuadState, Timestamp};
use std::sync::Arc;

/// Per-session spatial partition, one grid per session.
pub struct State {
    grid: Mutex<RegularGrid>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            grid: Mutex::new(RegularGrid::default()),
        }
    }
}

impl State {
    pub fn with_grid<R>(&self, f: impl FnOnce(&mut RegularGrid) -> R) -> R {
        f(&mut self.grid.lock())
    }
}

#[derive(Default)]
pub struct DagazModule {
    session: Option<Arc<Session>>,
}

impl DagazModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Result<&Arc<Session>, ModuleError> {
        self.session
            .as_ref()
            .ok_or_else(|| ModuleError::Fatal("session not joined".to_string()))
    }

    fn handle_quad_sample(&self, samples: &[QuadState]) -> Result<(), ModuleError> {
        let session = self.session()?;
        session.modules.dagaz.with_grid(|grid| {
            for sample in samples {
                grid.insert_quad(Quad::from_state(*sample));
            }
        });
        Ok(())
    }

    fn handle_get_ground_plane(
        &self,
        respond: &Outbox,
        request_id: u32,
        ray: skein_shared::RayState,
    ) -> Result<(), ModuleError> {
        let session = self.session()?;
        let hit = session
            .modules
            .dagaz
            .with_grid(|grid| grid.intersect(&Ray::from_state(ray)));

        // A miss still gets a response, with a zeroed quad.
        let ground = hit.map(|(quad, _)| quad.to_state()).unwrap_or_default();

        respond.send_packet(&Packet::DagazGetGroundPlaneResponse {
            timestamp: Timestamp::now(),
            request_id,
            ground,
        });
        Ok(())
    }

    fn handle_get_region(
        &self,
        respond: &Outbox,
        request_id: u32,
        min: skein_shared::Vec3State,
        max: skein_shared::Vec3State,
    ) -> Result<(), ModuleError> {
        let session = self.session()?;
        let quads = session.modules.dagaz.with_grid(|grid| {
            grid.get_region(Vec3::from_state(min), Vec3::from_state(max))
                .into_iter()
                .map(Quad::to_state)
                .collect()
        });

        respond.send_packet(&Packet::DagazGetRegionResponse {
            timestamp: Timestamp::now(),
            request_id,
            quads,
        });
        Ok(())
    }

    fn handle_get_debug_info(&self, respond: &Outbox, request_id: u32) -> Result<(), ModuleError> {
        let session = self.session()?;
        let info = session.modules.dagaz.with_grid(|grid| grid.debug_info());

        respond.send_packet(&Packet::DagazGetDebugInfoResponse {
            timestamp: Timestamp::now(),
            request_id,
            grid_resolution: info.resolution,
            grid_row_count: info.row_count,
            grid_col_count: info.col_count,
            grid_plane_count: info.plane_count,
            grid_merge_count: info.merge_count,
            grid_min_point: info.min.to_state(),
            grid_max_point: info.max.to_state(),
            occupancy: info.occupancy,
        });
        Ok(())
    }
}

impl Module for DagazModule {
    fn name(&self) -> &'static str {
        "dagaz"
    }

    fn init(&mut self, session: &Arc<Session>, _participant: &Arc<Participant>) {
        self.session = Some(Arc::clone(session));
    }

    fn handle_msg(&mut self, respond: &Outbox, packet: &Packet) -> Result<(), ModuleError> {
        match packet {
            Packet::DagazQuadSample { samples, .. } => self.handle_quad_sample(samples),
            Packet::DagazGetGroundPlaneRequest {
                request_id, ray, ..
            } => self.handle_get_ground_plane(respond, *request_id, *ray),
            Packet::DagazGetRegionRequest {
                request_id,
                min,
                max,
                ..
            } => self.handle_get_region(respond, *request_id, *min, *max),
            Packet::DagazGetDebugInfoRequest { request_id, .. } => {
                self.handle_get_debug_info(respond, *request_id)
            }
            _ => Err(ModuleError::Skip),
        }
    }

    fn handle_disconnect(&mut self) {}
}
