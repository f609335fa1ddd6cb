mod args;

use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use futures::sink::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::{select, signal};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::args::Args;
use qbroker::sched::Clock;
use qbroker::server::{self, BrokerHandle, BrokerReply};
use qbroker::store::Store;
use qbroker::wal::{FsyncPolicy, Wal};
use qbroker::wire::events::BeanstalkClientEvent;
use qbroker::wire::protocol::{Command, Response};
use qbroker::wire::{self, decoder};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt().with_max_level(Level::TRACE).init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let clock = Clock::new();
    let mut store = Store::new(args.max_job_size);

    let (wal, replayed_jobs) = match &args.wal_dir {
        Some(dir) => {
            let fsync = if args.no_fsync { FsyncPolicy::Disabled } else { FsyncPolicy::EveryMs(args.fsync_ms) };
            match Wal::open(dir.clone(), args.segment_size, fsync) {
                Ok((wal, outcome)) => {
                    info!(files = outcome.files_read, jobs = outcome.jobs.len(), "WAL opened");
                    (wal, outcome.jobs)
                },
                Err(error) => {
                    error!(%error, dir = %dir.display(), "failed to open write-ahead log");
                    return ExitCode::from(10);
                },
            }
        },
        None => (Wal::disabled(), Vec::new()),
    };

    for job in replayed_jobs {
        store.replay_insert(job);
    }

    let (broker, broker_task) = server::spawn(store, wal, clock);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            };
            cancel.cancel();
        });
    }

    let listener = match TcpListener::bind((args.listen, args.port)).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to listen for connections");
            return ExitCode::from(111);
        },
    };

    let (shutdown_hold, mut shutdown_wait) = mpsc::channel::<()>(1);

    let exit_code = match accept_loop(cancel, shutdown_hold, listener, broker, args.max_job_size).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    };

    shutdown_wait.recv().await;
    broker_task.abort();

    exit_code
}

async fn accept_loop(
    cancel: CancellationToken,
    shutdown_hold: mpsc::Sender<()>,
    listener: TcpListener,
    broker: BrokerHandle,
    max_job_size: u32,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        match select! {
            accept = listener.accept() => accept,
            _ = cancel.cancelled() => return Ok(()),
        } {
            Ok((conn, _)) => {
                tokio::spawn(do_client_loop(cancel.clone(), shutdown_hold.clone(), conn, broker.clone(), max_job_size));
            },
            Err(error) => {
                warn!(%error, "failed to accept connection");
                continue;
            },
        };
    }
}

#[instrument(name = "client_loop", err(level = Level::WARN), fields(peer = %conn.peer_addr()?), skip_all)]
async fn do_client_loop(
    cancel: CancellationToken,
    _shutdown_hold: mpsc::Sender<()>,
    conn: TcpStream,
    broker: BrokerHandle,
    max_job_size: u32,
) -> Result<()> {
    debug!("accepted connection");

    conn.set_nodelay(true).context("setting NODELAY")?;

    let mut framed = wire::framed(conn);
    let conn_id = broker.connect().await;

    let conn_result = loop {
        let evt = select! {
            x = framed.next() => match x {
                None => {
                    debug!("connection dropped");
                    break Ok(())
                },
                Some(r) => r,
            },
            _ = cancel.cancelled() => break Ok(()),
        };

        let evt = match evt {
            Ok(BeanstalkClientEvent::Discarded) => continue,
            Ok(e) => e,
            Err(decoder::Error::IO(e)) => break Err(e.into()),
            Err(decoder::Error::Client(resp)) => {
                select! {
                    x = framed.send(resp) => x?,
                    _ = cancel.cancelled() => break Ok(()),
                }
                break Err(anyhow!("client sent bad request and was disconnected"));
            },
        };

        let BeanstalkClientEvent::Command(cmd) = evt else {
            framed.send(Response::BadFormat).await?;
            continue;
        };

        if matches!(cmd, Command::Quit) {
            break Ok(());
        }

        let body = if let Command::Put { n_bytes, .. } = &cmd {
            match collect_put_body(&mut framed, &cancel, *n_bytes, max_job_size).await? {
                Some(PutBody::Body(body)) => Some(body),
                Some(PutBody::TooBig) => {
                    select! {
                        x = framed.send(Response::JobTooBig) => x?,
                        _ = cancel.cancelled() => break Ok(()),
                    }
                    continue;
                },
                None => break Ok(()),
            }
        } else {
            None
        };

        let reply = broker.command(conn_id, cmd, body).await;

        let send_result = async {
            match reply {
                BrokerReply::Plain(resp) => framed.send(resp).await,
                BrokerReply::WithBody { header, body } => {
                    framed.send(header).await?;
                    framed.send(Response::JobChunk(body)).await?;
                    framed.send(Response::JobEnd).await
                },
            }
        };

        select! {
            x = send_result => x?,
            _ = cancel.cancelled() => break Ok(()),
        }
    };

    broker.disconnect(conn_id).await;

    framed.into_inner().shutdown().await.context("during shutdown")?;

    conn_result
}

/// Outcome of reassembling a `put` body: either the bytes, or a body
/// whose declared size exceeded `max_job_size` and was discarded rather
/// than buffered.
enum PutBody {
    Body(Bytes),
    TooBig,
}

/// Collects the `PutChunk`/`PutEnd` events the decoder emits after a `put`
/// command line, reassembling the job body. Returns `Ok(None)` if the
/// connection closed mid-body.
///
/// When the client's declared `n_bytes` already exceeds `max_job_size`,
/// this never allocates a buffer sized to it: incoming chunks are read
/// and dropped rather than accumulated, the same way the reference
/// server's `bitbucket`/`wantendline` states consume and discard an
/// oversize body without holding it in memory.
async fn collect_put_body<T>(
    framed: &mut tokio_util::codec::Framed<T, wire::Codec>,
    cancel: &CancellationToken,
    n_bytes: u32,
    max_job_size: u32,
) -> Result<Option<PutBody>>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let too_big = n_bytes > max_job_size;
    let mut body = if too_big { BytesMut::new() } else { BytesMut::with_capacity(n_bytes as usize) };
    loop {
        let evt = select! {
            x = framed.next() => match x {
                None => return Ok(None),
                Some(r) => r,
            },
            _ = cancel.cancelled() => return Ok(None),
        };
        match evt {
            Ok(BeanstalkClientEvent::PutChunk(chunk)) => {
                if !too_big {
                    body.extend_from_slice(&chunk);
                }
            },
            Ok(BeanstalkClientEvent::PutEnd) => {
                return Ok(Some(if too_big { PutBody::TooBig } else { PutBody::Body(body.freeze()) }));
            },
            Ok(BeanstalkClientEvent::Discarded) => return Ok(None),
            Ok(BeanstalkClientEvent::Command(_)) => return Ok(None),
            Err(decoder::Error::IO(e)) => return Err(e.into()),
            Err(decoder::Error::Client(resp)) => {
                let _ = framed.send(resp).await;
                return Ok(None);
            },
        }
    }
}
