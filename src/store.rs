//! The job store and tube registry: the in-memory heart of the broker.
//!
//! Everything in this module is synchronous and has no notion of sockets,
//! channels, or the WAL — it is the pure state machine described by the
//! job/tube/connection data model, kept deliberately free of I/O so it can
//! be driven directly from unit tests. The broker (`crate::server`) is the
//! only thing that talks to both this module and the WAL, gluing the two
//! together per the "WAL reservation -> store mutation -> WAL write ->
//! reply" data flow.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU64;

use bytes::Bytes;

use crate::sched::SAFETY_MARGIN_NS;
use crate::types::job::Job;
use crate::types::states::JobState;
use crate::types::tube::Tube;

/// Jobs with priority below this are counted as "urgent" in tube/server
/// stats.
pub const URGENT_THRESHOLD: u32 = 1024;

/// Tube names longer than this are truncated.
pub const MAX_TUBE_NAME_LEN: usize = 200;

pub const DEFAULT_TUBE: &[u8] = b"default";

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct JobId(NonZeroU64);

impl JobId {
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl TryFrom<u64> for JobId {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        NonZeroU64::new(value).map(JobId).ok_or(())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    NotIgnored,
}

fn secs_to_ns(secs: u32) -> i64 {
    i64::from(secs) * 1_000_000_000
}

fn norm_tube_name(name: &[u8]) -> Bytes {
    let len = name.len().min(MAX_TUBE_NAME_LEN);
    Bytes::copy_from_slice(&name[..len])
}

/// Server-side bookkeeping for one client connection. The socket itself and
/// the wire codec live in the connection's own I/O task; only the protocol
/// state needed to answer other connections' requests (tube membership,
/// reserved jobs, blocking-reserve bookkeeping) lives here.
#[derive(Debug, Default)]
pub struct ConnEntry {
    pub use_tube: Bytes,
    pub watch: HashSet<Bytes>,
    pub reserved: HashSet<JobId>,
    pub is_producer: bool,
    pub is_worker: bool,
    pub is_waiting: bool,
    /// Some(secs) while blocked in `reserve-with-timeout`; None while
    /// blocked in plain `reserve` (which waits forever) or not blocked.
    pub pending_timeout_secs: Option<u32>,
    /// Absolute deadline for an in-progress `reserve-with-timeout`.
    pub reserve_deadline: Option<i64>,
    /// Cache of the reserved job with the soonest `deadline_at`. `None`
    /// means "unknown, recompute on demand" as well as "no reserved jobs"
    /// (both are handled identically: recomputation is cheap).
    soonest_cache: Option<Option<i64>>,
}

impl ConnEntry {
    fn invalidate_soonest(&mut self) {
        self.soonest_cache = None;
    }
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub promoted: Vec<JobId>,
    pub ttr_timeouts: Vec<JobId>,
    pub reserve_timeouts: Vec<ConnId>,
    /// Connections blocked in `reserve` that hold another job whose TTR
    /// is about to expire: their `reserve` resolves early with
    /// `DEADLINE_SOON` so the client has a chance to `touch` it.
    pub deadline_soon: Vec<ConnId>,
    pub unpaused: Vec<Bytes>,
}

/// What happened to a job matched from a waiting `reserve`.
pub struct Matched {
    pub conn: ConnId,
    pub job: JobId,
    pub ttr_secs: u32,
}

pub struct Store {
    jobs: HashMap<JobId, Job>,
    tubes: HashMap<Bytes, Tube>,
    conns: HashMap<ConnId, ConnEntry>,
    next_id: u64,
    next_conn: u64,
    pub draining: bool,
    pub max_job_size: u32,
    pub total_jobs: u64,
    pub job_timeouts: u64,
}

impl Store {
    pub fn new(max_job_size: u32) -> Self {
        let mut tubes = HashMap::new();
        tubes.insert(Bytes::from_static(DEFAULT_TUBE), Tube::new(Bytes::from_static(DEFAULT_TUBE)));
        Store {
            jobs: HashMap::new(),
            tubes,
            conns: HashMap::new(),
            next_id: 1,
            next_conn: 1,
            draining: false,
            max_job_size,
            total_jobs: 0,
            job_timeouts: 0,
        }
    }

    fn alloc_id(&mut self) -> JobId {
        let id = JobId::try_from(self.next_id).expect("next_id is always nonzero");
        self.next_id += 1;
        id
    }

    /// Ensures the id counter stays ahead of every id seen during WAL
    /// replay, so freshly `put` jobs never collide with a replayed one.
    pub fn observe_replayed_id(&mut self, id: JobId) {
        self.next_id = self.next_id.max(id.get() + 1);
    }

    fn tube_mut_or_create(&mut self, name: &Bytes) -> &mut Tube {
        self.tubes.entry(name.clone()).or_insert_with(|| Tube::new(name.clone()))
    }

    fn gc_tube(&mut self, name: &Bytes) {
        if name.as_ref() == DEFAULT_TUBE {
            return;
        }
        if matches!(self.tubes.get(name), Some(t) if !t.is_referenced()) {
            self.tubes.remove(name);
        }
    }

    pub fn tube(&self, name: &[u8]) -> Option<&Tube> {
        self.tubes.get(name)
    }

    pub fn tubes(&self) -> impl Iterator<Item = &Tube> {
        self.tubes.values()
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn jobs_len(&self) -> usize {
        self.jobs.len()
    }

    pub fn conns_len(&self) -> usize {
        self.conns.len()
    }

    pub fn total_connections(&self) -> u64 {
        self.next_conn - 1
    }

    // -- connections ---------------------------------------------------

    pub fn connect(&mut self) -> ConnId {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        let default = Bytes::from_static(DEFAULT_TUBE);
        let tube = self.tube_mut_or_create(&default);
        tube.using_ct += 1;
        tube.watching_ct += 1;
        let mut watch = HashSet::new();
        watch.insert(default.clone());
        self.conns.insert(
            id,
            ConnEntry {
                use_tube: default,
                watch,
                ..Default::default()
            },
        );
        id
    }

    /// Tears down a connection's bookkeeping, returning the ids of jobs it
    /// held reserved so the caller can WAL-log their release and reply to
    /// no one (the client is gone).
    pub fn disconnect(&mut self, conn_id: ConnId) -> Vec<JobId> {
        let Some(entry) = self.conns.remove(&conn_id) else {
            return Vec::new();
        };

        for name in entry.watch.iter().cloned().collect::<Vec<_>>() {
            if let Some(t) = self.tubes.get_mut(&name) {
                t.watching_ct = t.watching_ct.saturating_sub(1);
            }
            self.gc_tube(&name);
        }
        if let Some(t) = self.tubes.get_mut(&entry.use_tube) {
            t.using_ct = t.using_ct.saturating_sub(1);
        }
        self.gc_tube(&entry.use_tube);

        self.remove_from_all_waiting_queues(conn_id);

        let mut released = Vec::new();
        for id in entry.reserved {
            if self.release_reserved_to_ready(id) {
                released.push(id);
            }
        }
        released
    }

    pub fn use_tube(&mut self, conn_id: ConnId, name: &[u8]) -> Bytes {
        let name = norm_tube_name(name);
        if let Some(entry) = self.conns.get_mut(&conn_id) {
            let old = entry.use_tube.clone();
            if old == name {
                return name;
            }
            entry.use_tube = name.clone();
            if let Some(t) = self.tubes.get_mut(&old) {
                t.using_ct = t.using_ct.saturating_sub(1);
            }
            self.gc_tube(&old);
            let t = self.tube_mut_or_create(&name);
            t.using_ct += 1;
        }
        name
    }

    pub fn watch(&mut self, conn_id: ConnId, name: &[u8]) -> u32 {
        let name = norm_tube_name(name);
        let Some(entry) = self.conns.get_mut(&conn_id) else {
            return 0;
        };
        if entry.watch.insert(name.clone()) {
            let t = self.tube_mut_or_create(&name);
            t.watching_ct += 1;
        }
        entry.watch.len() as u32
    }

    pub fn ignore(&mut self, conn_id: ConnId, name: &[u8]) -> Result<u32, StoreError> {
        let name = norm_tube_name(name);
        let Some(entry) = self.conns.get_mut(&conn_id) else {
            return Err(StoreError::NotFound);
        };
        if entry.watch.len() <= 1 {
            return Err(StoreError::NotIgnored);
        }
        if entry.watch.remove(&name) {
            if let Some(t) = self.tubes.get_mut(&name) {
                t.watching_ct = t.watching_ct.saturating_sub(1);
            }
            self.gc_tube(&name);
        }
        Ok(self.conns[&conn_id].watch.len() as u32)
    }

    pub fn set_producer(&mut self, conn_id: ConnId) {
        if let Some(e) = self.conns.get_mut(&conn_id) {
            e.is_producer = true;
        }
    }

    pub fn set_worker(&mut self, conn_id: ConnId) {
        if let Some(e) = self.conns.get_mut(&conn_id) {
            e.is_worker = true;
        }
    }

    pub fn conn_counts(&self) -> (u64, u64, u64) {
        let mut producers = 0;
        let mut workers = 0;
        let mut waiting = 0;
        for e in self.conns.values() {
            if e.is_producer {
                producers += 1;
            }
            if e.is_worker {
                workers += 1;
            }
            if e.is_waiting {
                waiting += 1;
            }
        }
        (producers, workers, waiting)
    }

    pub fn use_tube_of(&self, conn_id: ConnId) -> Option<Bytes> {
        self.conns.get(&conn_id).map(|e| e.use_tube.clone())
    }

    pub fn watch_set_of(&self, conn_id: ConnId) -> Vec<Bytes> {
        self.conns
            .get(&conn_id)
            .map(|e| e.watch.iter().cloned().collect())
            .unwrap_or_default()
    }

    // -- put / reserve / delete / release / bury / kick / touch --------

    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &mut self,
        tube_name: &Bytes,
        pri: u32,
        delay_secs: u32,
        ttr_secs: u32,
        body: Bytes,
        now_ns: i64,
    ) -> JobId {
        let id = self.alloc_id();
        let ttr_secs = ttr_secs.max(1);
        let urgent = pri < URGENT_THRESHOLD;
        let body_size = body.len() as u32;

        let tube = self.tube_mut_or_create(tube_name);
        let (state, deadline_at) = if delay_secs > 0 {
            let deadline_at = now_ns + secs_to_ns(delay_secs);
            tube.put_delayed(id, deadline_at);
            (JobState::Delayed, deadline_at)
        } else {
            let pos = tube.put_ready(id, urgent);
            (JobState::Ready { pos }, 0)
        };
        tube.stats.total_jobs += 1;
        self.total_jobs += 1;

        let job = Job {
            id,
            tube: tube_name.clone(),
            pri,
            delay_secs,
            ttr_secs,
            body_size,
            created_at: now_ns,
            deadline_at,
            reserve_ct: 0,
            timeout_ct: 0,
            release_ct: 0,
            bury_ct: 0,
            kick_ct: 0,
            state,
            body,
            wal_file: None,
            wal_resv: 0,
            wal_used: 0,
        };
        self.jobs.insert(id, job);
        id
    }

    /// Inserts a job reconstructed from the WAL. The job's persistent
    /// fields (including `state`, downgraded from `Reserved` to `Ready` by
    /// the WAL layer already) are taken as given; this only wires it into
    /// its tube's live structures.
    pub fn replay_insert(&mut self, mut job: Job) {
        self.observe_replayed_id(job.id);
        self.total_jobs += 1;
        let tube_name = job.tube.clone();
        let urgent = job.is_urgent();
        let tube = self.tube_mut_or_create(&tube_name);
        tube.stats.total_jobs += 1;
        match job.state {
            JobState::Ready { .. } => {
                let pos = tube.put_ready(job.id, urgent);
                job.state = JobState::Ready { pos };
            },
            JobState::Delayed => {
                tube.put_delayed(job.id, job.deadline_at);
            },
            JobState::Buried { .. } => {
                let pos = tube.put_buried(job.id);
                job.state = JobState::Buried { pos };
            },
            JobState::Reserved { .. } => unreachable!("WAL layer downgrades Reserved to Ready"),
        }
        self.jobs.insert(job.id, job);
    }

    /// Tries to hand `conn_id` the highest-priority ready job from any tube
    /// it watches (skipping paused tubes). Used for both the immediate
    /// path (nothing to wait for) and the deferred match-on-arrival path.
    fn reserve_best_for(&mut self, conn_id: ConnId, now_ns: i64) -> Option<(JobId, u32)> {
        let watch = self.conns.get(&conn_id)?.watch.clone();
        let mut best: Option<(u32, JobId, Bytes)> = None;
        for name in &watch {
            let Some(tube) = self.tubes.get(name) else { continue };
            if tube.is_paused(now_ns) {
                continue;
            }
            for jid in tube.ready_ids() {
                let pri = self.jobs[&jid].pri;
                if best.as_ref().map(|(p, i, _)| (*p, *i) > (pri, jid)).unwrap_or(true) {
                    best = Some((pri, jid, name.clone()));
                }
            }
        }
        let (_, job_id, tube_name) = best?;

        let tube = self.tubes.get_mut(&tube_name).unwrap();
        let JobState::Ready { pos } = self.jobs[&job_id].state else {
            unreachable!("ready_ids only yields jobs in Ready state")
        };
        let urgent = self.jobs[&job_id].is_urgent();
        tube.take_ready(pos, urgent);
        tube.stats.current_jobs_reserved += 1;

        let job = self.jobs.get_mut(&job_id).unwrap();
        job.reserve_ct += 1;
        job.deadline_at = now_ns + job.ttr_ns();
        job.state = JobState::Reserved { by: conn_id };
        let ttr_secs = job.ttr_secs;

        let conn = self.conns.get_mut(&conn_id).unwrap();
        conn.reserved.insert(job_id);
        conn.is_waiting = false;
        conn.pending_timeout_secs = None;
        conn.reserve_deadline = None;
        conn.invalidate_soonest();

        Some((job_id, ttr_secs))
    }

    /// Attempts an immediate reservation for `conn_id`. If nothing is
    /// available, marks the connection as waiting on every tube it
    /// watches (`timeout_secs = None` for a plain `reserve`, which blocks
    /// forever) and returns `None`.
    pub fn reserve(&mut self, conn_id: ConnId, timeout_secs: Option<u32>, now_ns: i64) -> Option<(JobId, u32)> {
        self.set_worker(conn_id);
        if let Some(m) = self.reserve_best_for(conn_id, now_ns) {
            return Some(m);
        }
        let watch = self.watch_set_of(conn_id);
        for name in &watch {
            self.tube_mut_or_create(name).waiting_conns.push_back(conn_id);
        }
        if let Some(e) = self.conns.get_mut(&conn_id) {
            e.is_waiting = true;
            e.pending_timeout_secs = timeout_secs;
            e.reserve_deadline = timeout_secs.map(|s| now_ns + secs_to_ns(s));
        }
        None
    }

    /// A `reserve-with-timeout 0` is a non-blocking poll: if this returns
    /// `None`, the caller should reply `TIMED_OUT` immediately rather than
    /// actually waiting.
    pub fn reserve_job(&mut self, conn_id: ConnId, id: JobId, now_ns: i64) -> Result<u32, StoreError> {
        self.set_worker(conn_id);
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound)?;
        let JobState::Ready { pos } = job.state else {
            return Err(StoreError::NotFound);
        };
        let tube_name = job.tube.clone();
        let urgent = job.is_urgent();
        self.tubes.get_mut(&tube_name).unwrap().take_ready(pos, urgent);
        self.tubes.get_mut(&tube_name).unwrap().stats.current_jobs_reserved += 1;

        let job = self.jobs.get_mut(&id).unwrap();
        job.reserve_ct += 1;
        job.deadline_at = now_ns + job.ttr_ns();
        job.state = JobState::Reserved { by: conn_id };
        let ttr_secs = job.ttr_secs;

        let conn = self.conns.get_mut(&conn_id).unwrap();
        conn.reserved.insert(id);
        conn.invalidate_soonest();

        Ok(ttr_secs)
    }

    pub fn delete(&mut self, conn_id: ConnId, id: JobId) -> Result<Job, StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound)?;
        let allowed = match job.state {
            JobState::Reserved { by } => by == conn_id,
            _ => true,
        };
        if !allowed {
            return Err(StoreError::NotFound);
        }
        let tube_name = job.tube.clone();
        match job.state {
            JobState::Ready { pos } => {
                let urgent = job.is_urgent();
                self.tubes.get_mut(&tube_name).unwrap().take_ready(pos, urgent);
            },
            JobState::Delayed => {
                let at = job.deadline_at;
                self.tubes.get_mut(&tube_name).unwrap().take_delayed(at, id);
            },
            JobState::Buried { pos } => {
                self.tubes.get_mut(&tube_name).unwrap().take_buried(pos);
            },
            JobState::Reserved { by } => {
                self.tubes.get_mut(&tube_name).unwrap().stats.current_jobs_reserved -= 1;
                if let Some(c) = self.conns.get_mut(&by) {
                    c.reserved.remove(&id);
                    c.invalidate_soonest();
                }
            },
        }
        self.tubes.get_mut(&tube_name).unwrap().stats.cmd_delete += 1;
        let job = self.jobs.remove(&id).unwrap();
        self.gc_tube(&tube_name);
        Ok(job)
    }

    pub fn release(
        &mut self,
        conn_id: ConnId,
        id: JobId,
        pri: u32,
        delay_secs: u32,
        now_ns: i64,
    ) -> Result<(), StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound)?;
        let JobState::Reserved { by } = job.state else {
            return Err(StoreError::NotFound);
        };
        if by != conn_id {
            return Err(StoreError::NotFound);
        }
        let tube_name = job.tube.clone();

        if let Some(c) = self.conns.get_mut(&conn_id) {
            c.reserved.remove(&id);
            c.invalidate_soonest();
        }
        let tube = self.tubes.get_mut(&tube_name).unwrap();
        tube.stats.current_jobs_reserved -= 1;

        let job = self.jobs.get_mut(&id).unwrap();
        job.pri = pri;
        job.release_ct += 1;
        let urgent = pri < URGENT_THRESHOLD;
        let tube = self.tubes.get_mut(&tube_name).unwrap();
        if delay_secs > 0 {
            let deadline_at = now_ns + secs_to_ns(delay_secs);
            job.delay_secs = delay_secs;
            job.deadline_at = deadline_at;
            tube.put_delayed(id, deadline_at);
            job.state = JobState::Delayed;
        } else {
            let pos = tube.put_ready(id, urgent);
            job.state = JobState::Ready { pos };
        }
        Ok(())
    }

    /// Used only for disconnect-time cleanup: releases a reserved job back
    /// to `Ready` unconditionally (no ownership check, no WAL-visible
    /// priority/delay change). Returns `true` if the job existed and was
    /// reserved.
    fn release_reserved_to_ready(&mut self, id: JobId) -> bool {
        let Some(job) = self.jobs.get(&id) else { return false };
        let JobState::Reserved { .. } = job.state else { return false };
        let tube_name = job.tube.clone();
        let urgent = job.is_urgent();
        let tube = self.tubes.get_mut(&tube_name).unwrap();
        tube.stats.current_jobs_reserved -= 1;
        let pos = tube.put_ready(id, urgent);
        let job = self.jobs.get_mut(&id).unwrap();
        job.state = JobState::Ready { pos };
        job.release_ct += 1;
        true
    }

    pub fn bury(&mut self, conn_id: ConnId, id: JobId, pri: u32) -> Result<(), StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound)?;
        let JobState::Reserved { by } = job.state else {
            return Err(StoreError::NotFound);
        };
        if by != conn_id {
            return Err(StoreError::NotFound);
        }
        let tube_name = job.tube.clone();

        if let Some(c) = self.conns.get_mut(&conn_id) {
            c.reserved.remove(&id);
            c.invalidate_soonest();
        }
        let tube = self.tubes.get_mut(&tube_name).unwrap();
        tube.stats.current_jobs_reserved -= 1;
        let pos = tube.put_buried(id);

        let job = self.jobs.get_mut(&id).unwrap();
        job.pri = pri;
        job.bury_ct += 1;
        job.state = JobState::Buried { pos };
        Ok(())
    }

    pub fn touch(&mut self, conn_id: ConnId, id: JobId, now_ns: i64) -> Result<(), StoreError> {
        let job = self.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        let JobState::Reserved { by } = job.state else {
            return Err(StoreError::NotFound);
        };
        if by != conn_id {
            return Err(StoreError::NotFound);
        }
        job.deadline_at = now_ns + job.ttr_ns();
        if let Some(c) = self.conns.get_mut(&conn_id) {
            c.invalidate_soonest();
        }
        Ok(())
    }

    /// Kicks up to `bound` jobs on `tube_name`: buried jobs first (oldest
    /// first); if there are none buried, delayed jobs instead. Returns the
    /// ids kicked, in the order they became ready, so the caller can
    /// WAL-log each.
    pub fn kick(&mut self, tube_name: &[u8], bound: u64) -> Vec<JobId> {
        let Some(tube) = self.tubes.get(tube_name) else { return Vec::new() };
        let mut kicked = Vec::new();
        if tube.buried_len() > 0 {
            for _ in 0..bound {
                let Some((pos, id)) = self.tubes.get(tube_name).unwrap().oldest_buried() else { break };
                self.tubes.get_mut(tube_name).unwrap().take_buried(pos);
                self.kick_one(id);
                kicked.push(id);
            }
        } else {
            // Kick promotes the soonest-deadline delayed jobs regardless of
            // whether they're due yet.
            for _ in 0..bound {
                let Some(id) = self.pop_soonest_delayed(tube_name) else { break };
                self.kick_one(id);
                kicked.push(id);
            }
        }
        kicked
    }

    fn pop_soonest_delayed(&mut self, tube_name: &[u8]) -> Option<JobId> {
        let at = self.tubes.get(tube_name)?.soonest_delayed()?;
        self.take_delayed_at(tube_name, at)
    }

    fn take_delayed_at(&mut self, tube_name: &[u8], at: i64) -> Option<JobId> {
        let tube = self.tubes.get_mut(tube_name)?;
        // Re-derive the id paired with `at`: delayed is keyed by (at, id),
        // and soonest_delayed only gave us `at`, so scan the jobs sharing
        // that instant (normally exactly one).
        let id = self
            .jobs
            .values()
            .find(|j| j.tube.as_ref() == tube_name && j.deadline_at == at && matches!(j.state, JobState::Delayed))
            .map(|j| j.id)?;
        tube.take_delayed(at, id);
        Some(id)
    }

    fn kick_one(&mut self, id: JobId) {
        let job = self.jobs.get_mut(&id).unwrap();
        job.kick_ct += 1;
        let urgent = job.is_urgent();
        let tube_name = job.tube.clone();
        let tube = self.tubes.get_mut(&tube_name).unwrap();
        let pos = tube.put_ready(id, urgent);
        self.jobs.get_mut(&id).unwrap().state = JobState::Ready { pos };
    }

    /// Kicks a single job by id (buried or delayed -> ready).
    pub fn kick_job(&mut self, id: JobId) -> Result<(), StoreError> {
        let job = self.jobs.get(&id).ok_or(StoreError::NotFound)?;
        let tube_name = job.tube.clone();
        match job.state {
            JobState::Buried { pos } => {
                self.tubes.get_mut(&tube_name).unwrap().take_buried(pos);
            },
            JobState::Delayed => {
                let at = job.deadline_at;
                self.tubes.get_mut(&tube_name).unwrap().take_delayed(at, id);
            },
            _ => return Err(StoreError::NotFound),
        }
        self.kick_one(id);
        Ok(())
    }

    pub fn peek_ready(&self, tube_name: &[u8]) -> Option<JobId> {
        let tube = self.tubes.get(tube_name)?;
        tube.ready_ids().min_by_key(|&id| (self.jobs[&id].pri, id))
    }

    pub fn peek_delayed(&self, tube_name: &[u8]) -> Option<JobId> {
        let tube = self.tubes.get(tube_name)?;
        let at = tube.soonest_delayed()?;
        self.jobs
            .values()
            .filter(|j| j.tube.as_ref() == tube_name && j.deadline_at == at && matches!(j.state, JobState::Delayed))
            .map(|j| j.id)
            .min()
    }

    pub fn peek_buried(&self, tube_name: &[u8]) -> Option<JobId> {
        self.tubes.get(tube_name)?.oldest_buried().map(|(_, id)| id)
    }

    pub fn pause_tube(&mut self, tube_name: &[u8], secs: u32, now_ns: i64) -> Result<(), StoreError> {
        let tube = self.tubes.get_mut(tube_name).ok_or(StoreError::NotFound)?;
        tube.pause(secs, now_ns);
        Ok(())
    }

    fn remove_from_all_waiting_queues(&mut self, conn_id: ConnId) {
        for tube in self.tubes.values_mut() {
            if let Some(i) = tube.waiting_conns.iter().position(|&c| c == conn_id) {
                tube.waiting_conns.remove(i);
            }
        }
    }

    /// Runs one scheduler tick: promotes due delayed jobs, expires TTRs
    /// and reserve-timeouts, and clears expired tube pauses. Does not
    /// perform matching; the caller should follow up with `match_all`.
    pub fn tick(&mut self, now_ns: i64) -> TickReport {
        let mut report = TickReport::default();
        let tube_names: Vec<Bytes> = self.tubes.keys().cloned().collect();

        for name in &tube_names {
            let due = self.tubes.get_mut(name).unwrap().drain_due_delayed(now_ns);
            for id in due {
                let urgent = self.jobs[&id].is_urgent();
                let pos = self.tubes.get_mut(name).unwrap().put_ready(id, urgent);
                self.jobs.get_mut(&id).unwrap().state = JobState::Ready { pos };
                report.promoted.push(id);
            }
        }

        let expired: Vec<(JobId, ConnId, Bytes)> = self
            .jobs
            .iter()
            .filter_map(|(&id, j)| match j.state {
                JobState::Reserved { by } if j.deadline_at <= now_ns => Some((id, by, j.tube.clone())),
                _ => None,
            })
            .collect();
        for (id, conn_id, tube_name) in expired {
            let urgent = self.jobs[&id].is_urgent();
            let tube = self.tubes.get_mut(&tube_name).unwrap();
            tube.stats.current_jobs_reserved -= 1;
            let pos = tube.put_ready(id, urgent);
            let job = self.jobs.get_mut(&id).unwrap();
            job.state = JobState::Ready { pos };
            job.timeout_ct += 1;
            self.job_timeouts += 1;
            if let Some(c) = self.conns.get_mut(&conn_id) {
                c.reserved.remove(&id);
                c.invalidate_soonest();
            }
            report.ttr_timeouts.push(id);
        }

        let expired_waiters: Vec<ConnId> = self
            .conns
            .iter()
            .filter_map(|(&cid, c)| match (c.is_waiting, c.reserve_deadline) {
                (true, Some(at)) if at <= now_ns => Some(cid),
                _ => None,
            })
            .collect();
        for cid in expired_waiters {
            if let Some(c) = self.conns.get_mut(&cid) {
                c.is_waiting = false;
                c.pending_timeout_secs = None;
                c.reserve_deadline = None;
            }
            self.remove_from_all_waiting_queues(cid);
            report.reserve_timeouts.push(cid);
        }

        for name in &tube_names {
            let t = self.tubes.get_mut(name).unwrap();
            if let Some(at) = t.unpause_at {
                if at <= now_ns {
                    t.unpause_at = None;
                    report.unpaused.push(name.clone());
                }
            }
        }

        let margin_candidates: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.is_waiting && !c.reserved.is_empty())
            .map(|(&cid, _)| cid)
            .collect();
        for cid in margin_candidates {
            let Some(soonest) = self.soonest_reserved_deadline(cid) else { continue };
            if soonest - SAFETY_MARGIN_NS > now_ns {
                continue;
            }
            if let Some(c) = self.conns.get_mut(&cid) {
                c.is_waiting = false;
                c.pending_timeout_secs = None;
                c.reserve_deadline = None;
            }
            self.remove_from_all_waiting_queues(cid);
            report.deadline_soon.push(cid);
        }

        report
    }

    /// Absolute ns timestamp of the next event this store cares about
    /// (delayed-job promotion, TTR/reserve-timeout expiry, tube unpause, or
    /// a waiting connection's own deadline-soon warning), if any. The
    /// broker sleeps until this instant (or until a new command arrives,
    /// whichever is sooner) before calling `tick`/`match_all` again.
    pub fn next_wake_ns(&mut self) -> Option<i64> {
        let mut earliest: Option<i64> = None;
        let mut consider = |at: i64, earliest: &mut Option<i64>| {
            *earliest = Some(earliest.map_or(at, |e: i64| e.min(at)));
        };

        for t in self.tubes.values() {
            if let Some(at) = t.soonest_delayed() {
                consider(at, &mut earliest);
            }
            if let Some(at) = t.unpause_at {
                consider(at, &mut earliest);
            }
        }
        for j in self.jobs.values() {
            if let JobState::Reserved { .. } = j.state {
                consider(j.deadline_at, &mut earliest);
            }
        }

        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for cid in conn_ids {
            let Some(c) = self.conns.get(&cid) else { continue };
            let (waiting, has_reserved, deadline) = (c.is_waiting, !c.reserved.is_empty(), c.reserve_deadline);
            if let Some(at) = deadline {
                consider(at, &mut earliest);
            }
            if waiting && has_reserved {
                if let Some(soonest) = self.soonest_reserved_deadline(cid) {
                    consider(soonest - SAFETY_MARGIN_NS, &mut earliest);
                }
            }
        }

        earliest
    }

    /// Matches newly-ready jobs against waiting consumers, tube by tube,
    /// FIFO within each tube's waiting set, until no tube with a ready job
    /// has any (still-live) waiting consumer left.
    pub fn match_all(&mut self, now_ns: i64) -> Vec<Matched> {
        let mut matched = Vec::new();
        let tube_names: Vec<Bytes> = self.tubes.keys().cloned().collect();
        for name in tube_names {
            loop {
                let eligible = match self.tubes.get(&name) {
                    Some(t) => !t.is_paused(now_ns) && t.ready_len() > 0 && !t.waiting_conns.is_empty(),
                    None => false,
                };
                if !eligible {
                    break;
                }
                let conn_id = self.tubes.get_mut(&name).unwrap().waiting_conns.pop_front();
                let Some(conn_id) = conn_id else { break };
                let still_waiting = self.conns.get(&conn_id).map(|c| c.is_waiting).unwrap_or(false);
                if !still_waiting {
                    continue;
                }
                if let Some((job_id, ttr_secs)) = self.reserve_best_for(conn_id, now_ns) {
                    matched.push(Matched { conn: conn_id, job: job_id, ttr_secs });
                }
            }
        }
        matched
    }

    pub fn soonest_reserved_deadline(&mut self, conn_id: ConnId) -> Option<i64> {
        let entry = self.conns.get(&conn_id)?;
        if let Some(cached) = entry.soonest_cache {
            return cached;
        }
        let soonest = entry
            .reserved
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(|j| j.deadline_at)
            .min();
        if let Some(e) = self.conns.get_mut(&conn_id) {
            e.soonest_cache = Some(soonest);
        }
        soonest
    }

    pub fn pending_timeout_secs(&self, conn_id: ConnId) -> Option<u32> {
        self.conns.get(&conn_id).and_then(|e| e.pending_timeout_secs)
    }

    pub fn is_waiting(&self, conn_id: ConnId) -> bool {
        self.conns.get(&conn_id).map(|e| e.is_waiting).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_000_000_000_000;

    fn default_tube() -> Bytes {
        Bytes::from_static(DEFAULT_TUBE)
    }

    #[test]
    fn put_then_reserve_returns_the_job() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 100, 0, 60, Bytes::from_static(b"hi"), T0);
        assert_eq!(s.jobs_len(), 1);

        let (got, ttr) = s.reserve(conn, None, T0).expect("job should be immediately available");
        assert_eq!(got, id);
        assert_eq!(ttr, 60);
        assert!(matches!(s.job(id).unwrap().state, JobState::Reserved { by } if by == conn));
    }

    #[test]
    fn reserve_blocks_when_nothing_ready() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        assert!(s.reserve(conn, None, T0).is_none());
        assert!(s.is_waiting(conn));
    }

    #[test]
    fn lower_priority_number_wins_first() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let low_pri = s.put(&default_tube(), 50, 0, 60, Bytes::from_static(b"a"), T0);
        let _high_pri = s.put(&default_tube(), 200, 0, 60, Bytes::from_static(b"b"), T0);

        let (got, _) = s.reserve(conn, None, T0).unwrap();
        assert_eq!(got, low_pri, "lower pri value must be served first");
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let first = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        let second = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"b"), T0);

        let (got, _) = s.reserve(conn, None, T0).unwrap();
        assert_eq!(got, first);
        let (got, _) = s.reserve(conn, None, T0).unwrap();
        assert_eq!(got, second);
    }

    #[test]
    fn delayed_job_promotes_on_tick() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 5, 60, Bytes::from_static(b"a"), T0);
        assert!(matches!(s.job(id).unwrap().state, JobState::Delayed));
        assert!(s.reserve(conn, None, T0).is_none());

        let report = s.tick(T0 + 4 * 1_000_000_000);
        assert!(report.promoted.is_empty(), "not due yet");

        let report = s.tick(T0 + 6 * 1_000_000_000);
        assert_eq!(report.promoted, vec![id]);
        assert!(matches!(s.job(id).unwrap().state, JobState::Ready { .. }));
    }

    #[test]
    fn delete_removes_job_from_any_state() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.delete(conn, id).expect("ready job should be deletable");
        assert!(s.job(id).is_none());
        assert_eq!(s.jobs_len(), 0);
    }

    #[test]
    fn delete_reserved_job_requires_the_reserving_conn() {
        let mut s = Store::new(65535);
        let owner = s.connect();
        let other = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(owner, None, T0).unwrap();

        assert_eq!(s.delete(other, id), Err(StoreError::NotFound));
        assert!(s.delete(owner, id).is_ok());
    }

    #[test]
    fn release_puts_job_back_as_ready_and_bumps_release_ct() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(conn, None, T0).unwrap();

        s.release(conn, id, 20, 0, T0).unwrap();
        let job = s.job(id).unwrap();
        assert!(matches!(job.state, JobState::Ready { .. }));
        assert_eq!(job.pri, 20);
        assert_eq!(job.release_ct, 1);
    }

    #[test]
    fn release_with_delay_goes_back_to_delayed() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(conn, None, T0).unwrap();

        s.release(conn, id, 10, 30, T0).unwrap();
        assert!(matches!(s.job(id).unwrap().state, JobState::Delayed));
    }

    #[test]
    fn bury_then_kick_returns_job_to_ready() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(conn, None, T0).unwrap();
        s.bury(conn, id, 5).unwrap();
        assert!(matches!(s.job(id).unwrap().state, JobState::Buried { .. }));

        let kicked = s.kick(DEFAULT_TUBE, 10);
        assert_eq!(kicked, vec![id]);
        assert!(matches!(s.job(id).unwrap().state, JobState::Ready { .. }));
    }

    #[test]
    fn kick_prefers_buried_over_delayed() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let buried_id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        let delayed_id = s.put(&default_tube(), 10, 100, 60, Bytes::from_static(b"b"), T0);
        s.reserve(conn, None, T0).unwrap();
        s.bury(conn, buried_id, 5).unwrap();

        let kicked = s.kick(DEFAULT_TUBE, 10);
        assert_eq!(kicked, vec![buried_id]);
        assert!(matches!(s.job(delayed_id).unwrap().state, JobState::Delayed));
    }

    #[test]
    fn touch_extends_the_ttr_deadline() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(conn, None, T0).unwrap();
        let original_deadline = s.job(id).unwrap().deadline_at;

        let later = T0 + 30 * 1_000_000_000;
        s.touch(conn, id, later).unwrap();
        let new_deadline = s.job(id).unwrap().deadline_at;
        assert!(new_deadline > original_deadline);
        assert_eq!(new_deadline, later + 60 * 1_000_000_000);
    }

    #[test]
    fn ttr_expiry_releases_job_back_to_ready_on_tick() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 5, Bytes::from_static(b"a"), T0);
        s.reserve(conn, None, T0).unwrap();

        let report = s.tick(T0 + 6 * 1_000_000_000);
        assert_eq!(report.ttr_timeouts, vec![id]);
        assert!(matches!(s.job(id).unwrap().state, JobState::Ready { .. }));
        assert_eq!(s.job(id).unwrap().timeout_ct, 1);
    }

    #[test]
    fn reserve_with_timeout_expires_on_tick() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        assert!(s.reserve(conn, Some(2), T0).is_none());

        let report = s.tick(T0 + 1_000_000_000);
        assert!(report.reserve_timeouts.is_empty());

        let report = s.tick(T0 + 3_000_000_000);
        assert_eq!(report.reserve_timeouts, vec![conn]);
        assert!(!s.is_waiting(conn));
    }

    #[test]
    fn disconnect_releases_reserved_jobs() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(conn, None, T0).unwrap();

        let released = s.disconnect(conn);
        assert_eq!(released, vec![id]);
        assert!(matches!(s.job(id).unwrap().state, JobState::Ready { .. }));
    }

    #[test]
    fn match_all_delivers_released_job_to_waiting_connection() {
        let mut s = Store::new(65535);
        let producer = s.connect();
        let worker = s.connect();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);
        s.reserve(producer, None, T0).unwrap();
        assert!(s.reserve(worker, None, T0).is_none(), "nothing ready, producer holds the only job");

        s.release(producer, id, 10, 0, T0).unwrap();
        let matched = s.match_all(T0);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].conn, worker);
        assert_eq!(matched[0].job, id);
    }

    #[test]
    fn paused_tube_withholds_delivery_until_unpause() {
        let mut s = Store::new(65535);
        let worker = s.connect();
        s.pause_tube(DEFAULT_TUBE, 10, T0).unwrap();
        let id = s.put(&default_tube(), 10, 0, 60, Bytes::from_static(b"a"), T0);

        assert!(s.reserve(worker, None, T0).is_none(), "paused tube must not deliver");

        let report = s.tick(T0 + 11 * 1_000_000_000);
        assert_eq!(report.unpaused, vec![default_tube()]);
        let matched = s.match_all(T0 + 11 * 1_000_000_000);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].job, id);
    }

    #[test]
    fn deadline_soon_fires_for_a_waiting_conn_with_an_expiring_reservation() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        let held = s.put(&default_tube(), 10, 0, 2, Bytes::from_static(b"held"), T0);
        s.reserve(conn, None, T0).unwrap();
        assert_eq!(s.job(held).unwrap().id, held);

        // Nothing else to reserve, so the same connection blocks on a
        // second `reserve` while still holding `held`.
        assert!(s.reserve(conn, None, T0).is_none());

        let report = s.tick(T0 + 2_000_000_000 - crate::sched::SAFETY_MARGIN_NS + 1);
        assert_eq!(report.deadline_soon, vec![conn]);
        assert!(!s.is_waiting(conn));
    }

    #[test]
    fn next_wake_ns_tracks_the_soonest_delay_promotion() {
        let mut s = Store::new(65535);
        let _id = s.put(&default_tube(), 10, 5, 60, Bytes::from_static(b"a"), T0);
        let wake = s.next_wake_ns().expect("a delayed job should produce a wake time");
        assert_eq!(wake, T0 + 5_000_000_000);
    }

    #[test]
    fn next_wake_ns_is_none_when_store_is_idle() {
        let mut s = Store::new(65535);
        let _conn = s.connect();
        assert_eq!(s.next_wake_ns(), None);
    }

    #[test]
    fn ignore_refuses_to_empty_the_watch_set() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        assert_eq!(s.ignore(conn, DEFAULT_TUBE), Err(StoreError::NotIgnored));
        s.watch(conn, b"other");
        assert_eq!(s.ignore(conn, DEFAULT_TUBE), Ok(1));
    }

    #[test]
    fn unreferenced_non_default_tube_is_garbage_collected_on_use_switch() {
        let mut s = Store::new(65535);
        let conn = s.connect();
        s.use_tube(conn, b"scratch");
        assert!(s.tube(b"scratch").is_some());
        s.use_tube(conn, DEFAULT_TUBE);
        assert!(s.tube(b"scratch").is_none(), "scratch tube should be gc'd once unreferenced");
    }
}
