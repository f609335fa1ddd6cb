use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use serde::Serialize;

use crate::store::{ConnId, JobId};

// Required tube functionality:
// * State transitions:
//   * Reserve by ID or by head of tube.
//   * Release by ID.
//   * Bury/unbury by ID.
//   * Touch by ID.
//   * Delayed -> Ready.
// * Meta:
//   * Count jobs in the tube by state.
//   * Get job stats or data by ID.
// NB: reserve by ID, delete are global operations that can be performed
// regardless of the queue being watched by the client.
// NB: bury and touch can be executed regardless of the current watch set,
// provided the client reserved that particular job.

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TubeStats {
    /// number of jobs in ready state with priority < 1024
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients that have `use`d this queue
    #[serde(rename = "current-using")]
    pub current_using: u64,
    /// number of clients that have `watch`ed this queue and are waiting on a
    /// `reserve`
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this queue
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    /// number of seconds this queue has been paused for in total
    pub pause: u32,
    /// number of `delete` commands issued for this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands issued for this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct BuriedPos(u64);

impl BuriedPos {
    /// Used only to construct a transient `JobState` while replaying the
    /// WAL, before the job has been reinserted into its tube's `buried`
    /// map (which assigns the real position).
    pub fn replay_placeholder() -> Self {
        BuriedPos(0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct ReadyPos(u64);

impl ReadyPos {
    /// See [`BuriedPos::replay_placeholder`].
    pub fn replay_placeholder() -> Self {
        ReadyPos(0)
    }
}

/// A named FIFO/priority queue.
///
/// `ready` and `buried` are kept as `BTreeMap<position, JobId>`, where
/// `position` is a per-tube monotonically increasing sequence number: this
/// gives O(log n) "find the minimum" and "remove by id" (via the id's
/// recorded position) without a hand-rolled array heap. `delayed` is a
/// `BTreeSet<(deadline, JobId)>`, so the soonest deadline is always the
/// first element.
#[derive(Debug)]
pub struct Tube {
    pub name: Bytes,

    ready: BTreeMap<ReadyPos, JobId>,
    ready_sn: u64,
    delayed: BTreeSet<(i64, JobId)>,
    buried: BTreeMap<BuriedPos, JobId>,
    buried_sn: u64,

    pub waiting_conns: VecDeque<ConnId>,

    pub using_ct: u32,
    pub watching_ct: u32,

    /// Duration of the most recently issued `pause-tube`, in seconds.
    pub pause_secs: u32,
    /// Absolute ns timestamp at which the tube un-pauses, if paused.
    pub unpause_at: Option<i64>,

    pub stats: TubeStats,
}

impl Tube {
    pub fn new(name: Bytes) -> Self {
        Tube {
            name,
            ready: BTreeMap::new(),
            ready_sn: 0,
            delayed: BTreeSet::new(),
            buried: BTreeMap::new(),
            buried_sn: 0,
            waiting_conns: VecDeque::new(),
            using_ct: 0,
            watching_ct: 0,
            pause_secs: 0,
            unpause_at: None,
            stats: TubeStats::default(),
        }
    }

    pub fn is_paused(&self, now_ns: i64) -> bool {
        matches!(self.unpause_at, Some(at) if at > now_ns)
    }

    pub fn pause(&mut self, secs: u32, now_ns: i64) {
        self.pause_secs = secs;
        self.unpause_at = if secs > 0 {
            Some(now_ns + i64::from(secs) * 1_000_000_000)
        } else {
            None
        };
        self.stats.pause = secs;
        self.stats.cmd_pause_tube += 1;
    }

    /// Inserts a job into the ready heap, returning its recorded position.
    pub fn put_ready(&mut self, id: JobId, urgent: bool) -> ReadyPos {
        let pos = ReadyPos(self.ready_sn);
        self.ready_sn += 1;
        self.ready.insert(pos, id);
        self.stats.current_jobs_ready += 1;
        if urgent {
            self.stats.current_jobs_urgent += 1;
        }
        pos
    }

    pub fn take_ready(&mut self, pos: ReadyPos, urgent: bool) {
        self.ready.remove(&pos);
        self.stats.current_jobs_ready -= 1;
        if urgent {
            self.stats.current_jobs_urgent -= 1;
        }
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn ready_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.ready.values().copied()
    }

    pub fn put_delayed(&mut self, id: JobId, deadline_at: i64) {
        self.delayed.insert((deadline_at, id));
        self.stats.current_jobs_delayed += 1;
    }

    pub fn take_delayed(&mut self, deadline_at: i64, id: JobId) {
        self.delayed.remove(&(deadline_at, id));
        self.stats.current_jobs_delayed -= 1;
    }

    pub fn soonest_delayed(&self) -> Option<i64> {
        self.delayed.first().map(|&(at, _)| at)
    }

    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    /// Removes and returns every delayed job whose deadline is `<= now_ns`.
    pub fn drain_due_delayed(&mut self, now_ns: i64) -> Vec<JobId> {
        let mut due = Vec::new();
        while let Some(&(at, id)) = self.delayed.first() {
            if at > now_ns {
                break;
            }
            self.delayed.remove(&(at, id));
            self.stats.current_jobs_delayed -= 1;
            due.push(id);
        }
        due
    }

    pub fn put_buried(&mut self, id: JobId) -> BuriedPos {
        let pos = BuriedPos(self.buried_sn);
        self.buried_sn += 1;
        self.buried.insert(pos, id);
        self.stats.current_jobs_buried += 1;
        pos
    }

    pub fn take_buried(&mut self, pos: BuriedPos) {
        self.buried.remove(&pos);
        self.stats.current_jobs_buried -= 1;
    }

    /// Returns the oldest buried job (lowest position) without removing it.
    pub fn oldest_buried(&self) -> Option<(BuriedPos, JobId)> {
        self.buried.iter().next().map(|(&pos, &id)| (pos, id))
    }

    pub fn buried_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.buried.values().copied()
    }

    pub fn buried_len(&self) -> usize {
        self.buried.len()
    }

    /// True when nothing (no producer/consumer reference, no resident job)
    /// is keeping this tube alive. An empty, unreferenced tube is garbage.
    pub fn is_referenced(&self) -> bool {
        self.using_ct > 0
            || self.watching_ct > 0
            || self.ready_len() > 0
            || self.delayed_len() > 0
            || self.buried_len() > 0
            || self.stats.current_jobs_reserved > 0
    }
}
