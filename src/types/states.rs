use serde::Serialize;

use crate::store::ConnId;
use super::tube::{BuriedPos, ReadyPos};

/// A job's position in the lifecycle state machine.
///
/// `deadline_at` on the owning [`Job`](super::job::Job) means different
/// things depending on which of these a job is in: the absolute unpause
/// time while `Delayed`, the absolute TTR expiry while `Reserved`, and is
/// unused otherwise.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Ready { pos: ReadyPos },
    Delayed,
    Reserved { by: ConnId },
    Buried { pos: BuriedPos },
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;
        match self {
            Ready { .. } => "ready",
            Delayed => "delayed",
            Reserved { .. } => "reserved",
            Buried { .. } => "buried",
        }
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
