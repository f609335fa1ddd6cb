use bytes::Bytes;

use super::states::JobState;
use crate::store::JobId;

/// A job, in whichever of its lifecycle states it currently occupies.
///
/// Fields up to and including `state` are the persistent fields: these are
/// exactly what gets written to (and read back from) the WAL. Everything
/// after is in-memory bookkeeping that never crosses the wire or the log.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub tube: Bytes,
    pub pri: u32,
    pub delay_secs: u32,
    pub ttr_secs: u32,
    pub body_size: u32,
    pub created_at: i64,
    pub deadline_at: i64,
    pub reserve_ct: u32,
    pub timeout_ct: u32,
    pub release_ct: u32,
    pub bury_ct: u32,
    pub kick_ct: u32,
    pub state: JobState,

    pub body: Bytes,

    /// Sequence number of the WAL segment holding this job's most recent
    /// full record, if the WAL is enabled and this job has been written at
    /// least once.
    pub wal_file: Option<u32>,
    /// Bytes pre-reserved against some segment for a future mutation of
    /// this job that have not yet been consumed by an actual write.
    pub wal_resv: u32,
    /// Bytes this job has actually caused to be written to the WAL so far.
    pub wal_used: u32,
}

impl Job {
    pub fn ttr_ns(&self) -> i64 {
        i64::from(self.ttr_secs) * 1_000_000_000
    }

    pub fn is_urgent(&self) -> bool {
        self.pri < crate::store::URGENT_THRESHOLD
    }
}
