//! The broker: a single task owning every mutable piece of server state
//! (the job store, the WAL, the wall-clock bridge, and per-connection
//! bookkeeping). Connection I/O tasks never touch `Store` or `Wal`
//! directly; they send a `BrokerRequest` over a channel and await a
//! reply. This mirrors the reference server's single-threaded,
//! no-locking design without actually running single-threaded: there's
//! exactly one task that can observe or mutate the store, so nothing
//! inside it needs a mutex.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until};
use tracing::info;

use crate::sched::Clock;
use crate::store::{ConnId, JobId, Matched, Store, StoreError};
use crate::types::job::Job;
use crate::wal::Wal;
use crate::wire::protocol::{Command, JobStats, Response, ServerStats, TubeStatsResp};

/// A reply to a command that carries a job body: the header response
/// (`Reserved`/`Found`) plus the bytes to stream after it as
/// `JobChunk`/`JobEnd`.
pub enum BrokerReply {
    Plain(Response),
    WithBody { header: Response, body: Bytes },
}

enum BrokerRequest {
    Connect {
        reply: oneshot::Sender<ConnId>,
    },
    Disconnect {
        conn: ConnId,
    },
    Command {
        conn: ConnId,
        cmd: Command,
        body: Option<Bytes>,
        reply: oneshot::Sender<BrokerReply>,
    },
    SetDraining {
        draining: bool,
    },
}

/// Handle held by each connection's I/O task to talk to the broker.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerRequest>,
}

impl BrokerHandle {
    pub async fn connect(&self) -> ConnId {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BrokerRequest::Connect { reply: tx }).await;
        rx.await.expect("broker task died")
    }

    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(BrokerRequest::Disconnect { conn }).await;
    }

    /// Flips the broker's drain flag: once set, `put` refuses new jobs
    /// with `Draining` instead of inserting them, mirroring the
    /// reference server's drain-mode signal handling.
    pub async fn set_draining(&self, draining: bool) {
        let _ = self.tx.send(BrokerRequest::SetDraining { draining }).await;
    }

    /// Sends a command and awaits its reply. For a blocking `reserve`,
    /// this simply waits until the broker has a job to hand back (or the
    /// reservation times out / gets a `DEADLINE_SOON`) -- there is no
    /// separate poll step.
    pub async fn command(&self, conn: ConnId, cmd: Command, body: Option<Bytes>) -> BrokerReply {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(BrokerRequest::Command { conn, cmd, body, reply: tx }).await.is_err() {
            return BrokerReply::Plain(Response::InternalError);
        }
        rx.await.unwrap_or(BrokerReply::Plain(Response::InternalError))
    }
}

/// Spawns the broker task and returns a handle to it plus its join
/// handle, so the caller can await a clean shutdown.
pub fn spawn(store: Store, wal: Wal, clock: Clock) -> (BrokerHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let broker = Broker {
        store,
        wal,
        clock,
        rx,
        pending: HashMap::new(),
        started_at_ns: clock.now_ns(),
        server_id: format!("{:x}-{:x}", std::process::id(), clock.now_ns()),
    };
    let handle = tokio::spawn(broker.run());
    (BrokerHandle { tx }, handle)
}

struct Broker {
    store: Store,
    wal: Wal,
    clock: Clock,
    rx: mpsc::Receiver<BrokerRequest>,
    /// Reply channels for connections blocked in `reserve`/
    /// `reserve-with-timeout`, keyed by connection. Resolved from
    /// `match_all`, from a TTR/reserve-timeout tick, or from a
    /// `DEADLINE_SOON` tick.
    pending: HashMap<ConnId, oneshot::Sender<BrokerReply>>,
    started_at_ns: i64,
    server_id: String,
}

impl Broker {
    async fn run(mut self) {
        info!("broker task started");
        loop {
            let wake_at = self.store.next_wake_ns().map(|ns| self.clock.to_instant(ns));
            let next_request = self.rx.recv();
            tokio::select! {
                req = next_request => {
                    match req {
                        Some(req) => self.handle_request(req),
                        None => break,
                    }
                }
                _ = sleep_until_or_forever(wake_at) => {
                    self.run_scheduler_tick();
                }
            }
        }
        info!("broker task shutting down");
    }

    fn handle_request(&mut self, req: BrokerRequest) {
        match req {
            BrokerRequest::Connect { reply } => {
                let id = self.store.connect();
                let _ = reply.send(id);
            },
            BrokerRequest::Disconnect { conn } => {
                self.pending.remove(&conn);
                let released = self.store.disconnect(conn);
                for id in released {
                    if let Some(job) = self.store.job(id) {
                        Self::wal_log_update(&mut self.wal, job);
                    }
                }
            },
            BrokerRequest::Command { conn, cmd, body, reply } => {
                match self.dispatch(conn, cmd, body) {
                    Some(r) => {
                        let _ = reply.send(r);
                    },
                    None => {
                        self.pending.insert(conn, reply);
                    },
                }
                self.run_matching();
            },
            BrokerRequest::SetDraining { draining } => {
                info!(draining, "drain mode changed");
                self.store.draining = draining;
            },
        }
    }

    /// Runs one pass of the scheduler: promotes delayed jobs, expires
    /// TTRs/reserve-timeouts/tube-pauses, resolves any now-unblocked
    /// `reserve`s, and lets the WAL compact/fsync.
    fn run_scheduler_tick(&mut self) {
        let now = self.clock.now_ns();
        let report = self.store.tick(now);

        if !report.promoted.is_empty() {
            tracing::debug!(count = report.promoted.len(), "delayed jobs promoted to ready");
        }
        if !report.unpaused.is_empty() {
            tracing::debug!(tubes = report.unpaused.len(), "tube pauses expired");
        }

        for cid in report.reserve_timeouts {
            if let Some(tx) = self.pending.remove(&cid) {
                let _ = tx.send(BrokerReply::Plain(Response::TimedOut));
            }
        }
        for cid in report.deadline_soon {
            if let Some(tx) = self.pending.remove(&cid) {
                let _ = tx.send(BrokerReply::Plain(Response::DeadlineSoon));
            }
        }
        for id in report.ttr_timeouts {
            if let Some(job) = self.store.job(id) {
                Self::wal_log_update(&mut self.wal, job);
            }
        }

        self.run_matching();

        let store = &mut self.store;
        self.wal.maintain(now, |id| store.job(id).cloned());
    }

    /// Resolves any reservations that became possible after a mutation
    /// (a `put`, a `release`, a `kick`, ...) or a scheduler tick.
    fn run_matching(&mut self) {
        let now = self.clock.now_ns();
        let matched = self.store.match_all(now);
        for Matched { conn, job, ttr_secs } in matched {
            if let Some(tx) = self.pending.remove(&conn) {
                let body = self.store.job(job).map(|j| j.body.clone()).unwrap_or_default();
                let n_bytes = body.len() as u32;
                let _ = tx.send(BrokerReply::WithBody {
                    header: Response::Reserved { id: job.get(), n_bytes },
                    body,
                });
            }
            let _ = ttr_secs;
        }
    }

    /// These take `wal` explicitly rather than `&mut self` so they can be
    /// called while the caller still holds a `&mut Job` borrowed out of
    /// `self.store` (the store and the WAL are disjoint fields).
    ///
    /// `put` reserves its WAL bytes *before* the job exists in the store
    /// (see `dispatch`'s `Put` arm): a reservation failure must surface as
    /// `OUT_OF_MEMORY` without ever touching the store, so the reservation
    /// and the write are split rather than done together here.
    fn wal_write_put(wal: &mut Wal, job: &mut Job) {
        wal.write_full(job);
    }

    fn wal_log_update(wal: &mut Wal, job: &Job) {
        if !wal.is_enabled() {
            return;
        }
        if wal.reserve_update() {
            wal.write_short(job, false);
        }
    }

    fn wal_log_delete(wal: &mut Wal, job: &Job) {
        if !wal.is_enabled() {
            return;
        }
        if wal.reserve_update() {
            wal.write_short(job, true);
        }
    }

    /// Handles one command. Returns `Some(reply)` to answer immediately,
    /// or `None` to leave the caller blocked (only for `reserve`/
    /// `reserve-with-timeout` with nothing immediately available).
    fn dispatch(&mut self, conn: ConnId, cmd: Command, body: Option<Bytes>) -> Option<BrokerReply> {
        let now = self.clock.now_ns();
        use Command::*;

        let reply = match cmd {
            Put { pri, delay, ttr, n_bytes: _ } => {
                let body = body.unwrap_or_default();
                if self.store.draining {
                    Response::Draining
                } else if body.len() as u32 > self.store.max_job_size {
                    Response::JobTooBig
                } else {
                    let tube = self.store.use_tube_of(conn).unwrap_or_default();
                    // WAL reservation happens before the store is touched:
                    // a failed reservation must leave no trace of the job.
                    if !self.wal.reserve_put(tube.len(), body.len() as u32) {
                        Response::OutOfMemory
                    } else {
                        let id = self.store.put(&tube, pri, delay, ttr, body, now);
                        if let Some(job) = self.store.job_mut(id) {
                            Self::wal_write_put(&mut self.wal, job);
                        }
                        Response::Inserted { id: id.get() }
                    }
                }
            },

            Reserve => {
                match self.store.reserve(conn, None, now) {
                    Some((id, ttr_secs)) => return Some(self.reserved_reply(id, ttr_secs)),
                    None => return None,
                }
            },
            ReserveWithTimeout { timeout } => {
                // A zero timeout is a non-blocking poll: `reserve` already
                // sets a reserve_deadline of `now`, so the very next
                // scheduler tick resolves it as an immediate timeout.
                match self.store.reserve(conn, Some(timeout), now) {
                    Some((id, ttr_secs)) => return Some(self.reserved_reply(id, ttr_secs)),
                    None => return None,
                }
            },
            ReserveJob { id } => match JobId::try_from(id) {
                Ok(id) => match self.store.reserve_job(conn, id, now) {
                    Ok(ttr_secs) => return Some(self.reserved_reply(id, ttr_secs)),
                    Err(_) => Response::NotFound,
                },
                Err(()) => Response::NotFound,
            },

            Delete { id } => match JobId::try_from(id) {
                Ok(id) => match self.store.delete(conn, id) {
                    Ok(job) => {
                        Self::wal_log_delete(&mut self.wal, &job);
                        Response::Deleted
                    },
                    Err(StoreError::NotFound) => Response::NotFound,
                    Err(StoreError::NotIgnored) => Response::NotFound,
                },
                Err(()) => Response::NotFound,
            },

            Release { id, pri, delay } => match JobId::try_from(id) {
                Ok(id) => match self.store.release(conn, id, pri, delay, now) {
                    Ok(()) => {
                        if let Some(job) = self.store.job(id) {
                            Self::wal_log_update(&mut self.wal, job);
                        }
                        Response::Released
                    },
                    Err(_) => Response::NotFound,
                },
                Err(()) => Response::NotFound,
            },

            Bury { id, pri } => match JobId::try_from(id) {
                Ok(id) => match self.store.bury(conn, id, pri) {
                    Ok(()) => {
                        if let Some(job) = self.store.job(id) {
                            Self::wal_log_update(&mut self.wal, job);
                        }
                        Response::Buried
                    },
                    Err(_) => Response::NotFound,
                },
                Err(()) => Response::NotFound,
            },

            Touch { id } => match JobId::try_from(id) {
                Ok(id) => match self.store.touch(conn, id, now) {
                    Ok(()) => {
                        if let Some(job) = self.store.job(id) {
                            Self::wal_log_update(&mut self.wal, job);
                        }
                        Response::Touched
                    },
                    Err(_) => Response::NotFound,
                },
                Err(()) => Response::NotFound,
            },

            Watch { tube } => Response::Watching { count: self.store.watch(conn, &tube) },
            Ignore { tube } => match self.store.ignore(conn, &tube) {
                Ok(count) => Response::Watching { count },
                Err(_) => Response::NotIgnored,
            },
            Use { tube } => Response::Using { tube: self.store.use_tube(conn, &tube).to_vec() },

            Peek { id } => match JobId::try_from(id).ok().and_then(|id| self.store.job(id)) {
                Some(job) => {
                    let id = job.id.get();
                    let body = job.body.clone();
                    return Some(BrokerReply::WithBody {
                        header: Response::Found { id, n_bytes: body.len() as u32 },
                        body,
                    });
                },
                None => Response::NotFound,
            },
            PeekReady => {
                let tube = self.store.use_tube_of(conn).unwrap_or_default();
                match self.store.peek_ready(&tube) {
                    Some(id) => return Some(self.found_reply(id)),
                    None => Response::NotFound,
                }
            },
            PeekDelayed => {
                let tube = self.store.use_tube_of(conn).unwrap_or_default();
                match self.store.peek_delayed(&tube) {
                    Some(id) => return Some(self.found_reply(id)),
                    None => Response::NotFound,
                }
            },
            PeekBuried => {
                let tube = self.store.use_tube_of(conn).unwrap_or_default();
                match self.store.peek_buried(&tube) {
                    Some(id) => return Some(self.found_reply(id)),
                    None => Response::NotFound,
                }
            },

            Kick { bound } => {
                let tube = self.store.use_tube_of(conn).unwrap_or_default();
                let kicked = self.store.kick(&tube, bound);
                let count = kicked.len() as u64;
                for id in kicked {
                    if let Some(job) = self.store.job(id) {
                        Self::wal_log_update(&mut self.wal, job);
                    }
                }
                Response::KickedCount { count }
            },
            KickJob { id } => match JobId::try_from(id) {
                Ok(id) => match self.store.kick_job(id) {
                    Ok(()) => {
                        if let Some(job) = self.store.job(id) {
                            Self::wal_log_update(&mut self.wal, job);
                        }
                        Response::Kicked
                    },
                    Err(_) => Response::NotFound,
                },
                Err(()) => Response::NotFound,
            },

            StatsJob { id } => match JobId::try_from(id).ok().and_then(|id| self.store.job(id)) {
                Some(job) => Response::OkStatsJob { data: self.job_stats(job, now) },
                None => Response::NotFound,
            },
            StatsTube { tube } => match self.store.tube(&tube) {
                Some(t) => Response::OkStatsTube { data: tube_stats_resp(t, now) },
                None => Response::NotFound,
            },
            StatsServer => Response::OkStats { data: self.server_stats(now) },

            ListTubes => {
                let tubes = self.store.tubes().map(|t| t.name.to_vec()).collect();
                Response::OkListTubes { tubes }
            },
            ListTubeUsed => Response::Using { tube: self.store.use_tube_of(conn).unwrap_or_default().to_vec() },
            ListTubesWatched => {
                Response::OkListTubes { tubes: self.store.watch_set_of(conn).into_iter().map(|t| t.to_vec()).collect() }
            },

            PauseTube { tube, delay } => match self.store.pause_tube(&tube, delay, now) {
                Ok(()) => Response::Paused,
                Err(_) => Response::NotFound,
            },

            Quit => Response::InternalError, // handled by the connection task before reaching here
        };

        Some(BrokerReply::Plain(reply))
    }

    fn reserved_reply(&self, id: JobId, ttr_secs: u32) -> BrokerReply {
        let _ = ttr_secs;
        let body = self.store.job(id).map(|j| j.body.clone()).unwrap_or_default();
        BrokerReply::WithBody { header: Response::Reserved { id: id.get(), n_bytes: body.len() as u32 }, body }
    }

    fn found_reply(&self, id: JobId) -> BrokerReply {
        let body = self.store.job(id).map(|j| j.body.clone()).unwrap_or_default();
        BrokerReply::WithBody { header: Response::Found { id: id.get(), n_bytes: body.len() as u32 }, body }
    }

    fn job_stats(&self, job: &Job, now: i64) -> JobStats {
        let age = ((now - job.created_at).max(0) / 1_000_000_000) as u32;
        let (delay, time_left) = match job.state {
            crate::types::states::JobState::Delayed => {
                let left = ((job.deadline_at - now).max(0) / 1_000_000_000) as u32;
                (left, left)
            },
            crate::types::states::JobState::Reserved { .. } => {
                (0, ((job.deadline_at - now).max(0) / 1_000_000_000) as u32)
            },
            _ => (0, 0),
        };
        JobStats {
            id: job.id.get(),
            tube: job.tube.to_vec(),
            state: job.state,
            pri: job.pri,
            age,
            delay,
            ttr: job.ttr_secs,
            time_left,
            file: job.wal_file.unwrap_or(0),
            reserves: u64::from(job.reserve_ct),
            timeouts: u64::from(job.timeout_ct),
            releases: u64::from(job.release_ct),
            buries: u64::from(job.bury_ct),
            kicks: u64::from(job.kick_ct),
        }
    }

    fn server_stats(&self, now: i64) -> ServerStats {
        let (producers, workers, waiting) = self.store.conn_counts();
        let wal = self.wal.stats();
        let mut ready = 0u64;
        let mut urgent = 0u64;
        let mut delayed = 0u64;
        let mut buried = 0u64;
        let mut reserved = 0u64;
        for t in self.store.tubes() {
            ready += t.ready_len() as u64;
            urgent += u64::from(t.stats.current_jobs_urgent);
            delayed += t.delayed_len() as u64;
            buried += t.buried_len() as u64;
            reserved += t.stats.current_jobs_reserved;
        }
        ServerStats {
            current_jobs_urgent: urgent,
            current_jobs_ready: ready,
            current_jobs_reserved: reserved,
            current_jobs_delayed: delayed,
            current_jobs_buried: buried,
            total_jobs: self.store.total_jobs,
            max_job_size: u64::from(self.store.max_job_size),
            current_tubes: self.store.tubes().count() as u64,
            current_connections: self.store.conns_len() as u64,
            current_producers: producers,
            current_workers: workers,
            current_waiting: waiting,
            total_connections: self.store.total_connections(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            uptime: ((now - self.started_at_ns).max(0) / 1_000_000_000) as u32,
            job_timeouts: self.store.job_timeouts,
            binlog_oldest_index: wal.as_ref().map(|w| u64::from(w.oldest_index)).unwrap_or(0),
            binlog_current_index: wal.as_ref().map(|w| u64::from(w.current_index)).unwrap_or(0),
            binlog_max_size: wal.as_ref().map(|w| u64::from(w.max_size)).unwrap_or(0),
            binlog_records_written: wal.as_ref().map(|w| w.records_written).unwrap_or(0),
            binlog_records_migrated: wal.as_ref().map(|w| w.records_migrated).unwrap_or(0),
            draining: self.store.draining,
            id: self.server_id.clone().into_bytes(),
            hostname: b"unknown".to_vec(),
            os: std::env::consts::OS.as_bytes().to_vec(),
            platform: std::env::consts::ARCH.as_bytes().to_vec(),
            ..Default::default()
        }
    }
}

fn tube_stats_resp(t: &crate::types::tube::Tube, now: i64) -> TubeStatsResp {
    let pause_time_left = t.unpause_at.map(|at| ((at - now).max(0) / 1_000_000_000) as u32).unwrap_or(0);
    TubeStatsResp { name: t.name.to_vec(), ts: t.stats.clone(), pause_time_left }
}

/// Sleeps until `at`, or forever if `at` is `None` -- used so the
/// scheduler-tick branch of the `select!` simply never fires when there
/// is nothing to wait for.
async fn sleep_until_or_forever(at: Option<tokio::time::Instant>) {
    match at {
        Some(instant) => sleep_until(instant).await,
        None => sleep(Duration::from_secs(3600)).await,
    }
}
