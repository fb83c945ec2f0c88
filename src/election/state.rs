use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire and storage value for "no known leader".
pub const NO_LEADER: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElectionState {
    Follower = 0,
    Candidate = 1,
    Leader = 2,
}

impl ElectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ElectionState::Candidate,
            2 => ElectionState::Leader,
            _ => ElectionState::Follower,
        }
    }
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElectionState::Follower => "follower",
            ElectionState::Candidate => "candidate",
            ElectionState::Leader => "leader",
        };
        f.write_str(name)
    }
}
