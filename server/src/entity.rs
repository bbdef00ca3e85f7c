//! Entity representation.

use parking_lot::RwLock;
use skein_shared::{EntityFlag, EntityState, Pose};

/// A participant-owned object with a mutable pose.
///
/// Ownership is exclusive: only the creating participant may mutate or delete
/// the entity. Entities are removed when their owner disconnects unless
/// `persist` is set. The pose sits under its own lock so concurrent readers
/// (broadcast encoding, session snapshots) never contend on the session maps.
#[derive(Debug)]
pub struct Entity {
    pub id: u32,
    pub participant_id: u32,
    pub persist: bool,
    pub flag: EntityFlag,
    pose: RwLock<Pose>,
}

impl Entity {
    pub fn new(id: u32, participant_id: u32, persist: bool, flag: EntityFlag) -> Self {
        Self {
            id,
            participant_id,
            persist,
            flag,
            pose: RwLock::new(Pose::default()),
        }
    }

    pub fn set_pose(&self, pose: Pose) {
        *self.pose.write() = pose;
    }

    pub fn pose(&self) -> Pose {
        *self.pose.read()
    }

    /// Snapshot for `SessionState` and entity broadcasts.
    pub fn to_state(&self) -> EntityState {
        EntityState {
            id: self.id,
            participant_id: self.participant_id,
            flag: self.flag,
            pose: self.pose(),
        }
    }
}
