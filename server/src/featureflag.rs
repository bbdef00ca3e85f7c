//! Feature flags toggling optional server emissions.

use std::collections::HashSet;
use std::str::FromStr;

/// A recognized feature flag token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    DisableSessionState,
    DisableParticipantJoinBroadcast,
    DisableParticipantLeaveBroadcast,
    DisableEntityAddBroadcast,
    DisableEntityDeleteBroadcast,
    DisableEntityUpdatePoseBroadcast,
    DisableCustomMessageBroadcast,
    DisableEntityComponentAddBroadcast,
    DisableEntityComponentUpdateBroadcast,
    DisableEntityComponentDeleteBroadcast,
}

impl FromStr for Flag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISABLE_SESSION_STATE" => Ok(Flag::DisableSessionState),
            "DISABLE_PARTICIPANT_JOIN_BROADCAST" => Ok(Flag::DisableParticipantJoinBroadcast),
            "DISABLE_PARTICIPANT_LEAVE_BROADCAST" => Ok(Flag::DisableParticipantLeaveBroadcast),
            "DISABLE_ENTITY_ADD_BROADCAST" => Ok(Flag::DisableEntityAddBroadcast),
            "DISABLE_ENTITY_DELETE_BROADCAST" => Ok(Flag::DisableEntityDeleteBroadcast),
            "DISABLE_ENTITY_UPDATE_POSE_BROADCAST" => Ok(Flag::DisableEntityUpdatePoseBroadcast),
            "DISABLE_CUSTOM_MESSAGE_BROADCAST" => Ok(Flag::DisableCustomMessageBroadcast),
            "DISABLE_ENTITY_COMPONENT_ADD_BROADCAST" => {
                Ok(Flag::DisableEntityComponentAddBroadcast)
            }
            "DISABLE_ENTITY_COMPONENT_UPDATE_BROADCAST" => {
                Ok(Flag::DisableEntityComponentUpdateBroadcast)
            }
            "DISABLE_ENTITY_COMPONENT_DELETE_BROADCAST" => {
                Ok(Flag::DisableEntityComponentDeleteBroadcast)
            }
            _ => Err(()),
        }
    }
}

/// The set of flags enabled for this server process.
#[derive(Debug, Default)]
pub struct FeatureFlags {
    flags: HashSet<Flag>,
}

impl FeatureFlags {
    /// Parses a comma-separated flag list. Unknown tokens are logged and
    /// ignored rather than rejected, so a newer client config keeps working
    /// against an older server.
    pub fn parse(list: &str) -> Self {
        let mut flags = HashSet::new();
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.parse() {
                Ok(flag) => {
                    flags.insert(flag);
                }
                Err(()) => log::warn!("ignoring unknown feature flag {:?}", token),
            }
        }
        Self { flags }
    }

    pub fn is_set(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}
