//! Protocol-level integration tests: real wire bytes through the decoder,
//! dispatched against a live broker, encoded back through the encoder.
//! Unlike the unit tests in `store.rs`/`wal.rs`, these exercise the wire
//! format and the broker actor together rather than `Store` directly.

use bytes::{Bytes, BytesMut};
use qbroker::sched::Clock;
use qbroker::server::{self, BrokerReply};
use qbroker::store::Store;
use qbroker::wal::Wal;
use qbroker::wire::decoder::Decoder;
use qbroker::wire::encoder::Encoder;
use qbroker::wire::events::BeanstalkClientEvent;
use qbroker::wire::protocol::{Command, Response};
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder as _, Encoder as _, FramedRead};

fn new_broker() -> (server::BrokerHandle, tokio::task::JoinHandle<()>) {
    server::spawn(Store::new(65535), Wal::disabled(), Clock::new())
}

/// Parses one command line (plus any `put` body chunks) from raw wire
/// bytes, the same way `bin/qbrokerd`'s connection task does.
async fn parse_one(line: &[u8]) -> (Command, Option<Bytes>) {
    let decoder: Decoder = Default::default();
    let mut framed = FramedRead::new(line, decoder);

    let BeanstalkClientEvent::Command(cmd) = framed.next().await.unwrap().unwrap() else {
        panic!("expected a command");
    };

    let mut body = None;
    if matches!(cmd, Command::Put { .. }) {
        let mut buf = BytesMut::new();
        loop {
            match framed.next().await.unwrap().unwrap() {
                BeanstalkClientEvent::PutChunk(chunk) => buf.extend_from_slice(&chunk),
                BeanstalkClientEvent::PutEnd => break,
                other => panic!("unexpected event while collecting put body: {other:?}"),
            }
        }
        body = Some(buf.freeze());
    }
    (cmd, body)
}

fn encode(resp: Response) -> Vec<u8> {
    let mut encoder = Encoder::default();
    let mut dst = BytesMut::new();
    encoder.encode(resp, &mut dst).expect("encodable response");
    dst.to_vec()
}

#[tokio::test]
async fn put_reserve_delete_round_trip() {
    let (broker, _task) = new_broker();
    let conn = broker.connect().await;

    let (cmd, body) = parse_one(b"put 10 0 60 5\r\nhello\r\n").await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::Plain(Response::Inserted { id }) = reply else {
        panic!("expected Inserted");
    };
    assert_eq!(encode(Response::Inserted { id }), b"INSERTED 1\r\n");

    let (cmd, body) = parse_one(b"reserve\r\n").await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::WithBody { header, body } = reply else {
        panic!("expected a job body");
    };
    assert_eq!(encode(header), b"RESERVED 1 5\r\n");
    assert_eq!(body.as_ref(), b"hello");

    let (cmd, body) = parse_one(format!("delete {id}\r\n").as_bytes()).await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::Plain(resp) = reply else { panic!("expected a plain reply") };
    assert_eq!(encode(resp), b"DELETED\r\n");
}

#[tokio::test]
async fn reserve_blocks_until_a_job_is_put() {
    let (broker, _task) = new_broker();
    let producer = broker.connect().await;
    let worker = broker.connect().await;

    let reserve_fut = {
        let broker = broker.clone();
        tokio::spawn(async move {
            let (cmd, body) = parse_one(b"reserve\r\n").await;
            broker.command(worker, cmd, body).await
        })
    };

    // give the reserving task a chance to register as waiting before the
    // job arrives
    tokio::task::yield_now().await;

    let (cmd, body) = parse_one(b"put 10 0 60 3\r\nfoo\r\n").await;
    broker.command(producer, cmd, body).await;

    let reply = reserve_fut.await.expect("reserve task should not panic");
    let BrokerReply::WithBody { header, body } = reply else {
        panic!("expected the put job to be delivered");
    };
    assert_eq!(encode(header), b"RESERVED 1 3\r\n");
    assert_eq!(body.as_ref(), b"foo");
}

#[tokio::test]
async fn bury_then_kick_round_trip() {
    let (broker, _task) = new_broker();
    let conn = broker.connect().await;

    let (cmd, body) = parse_one(b"put 10 0 60 3\r\nbar\r\n").await;
    broker.command(conn, cmd, body).await;

    let (cmd, body) = parse_one(b"reserve\r\n").await;
    broker.command(conn, cmd, body).await;

    let (cmd, body) = parse_one(b"bury 1 5\r\n").await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::Plain(resp) = reply else { panic!("expected a plain reply") };
    assert_eq!(encode(resp), b"BURIED\r\n");

    let (cmd, body) = parse_one(b"kick 10\r\n").await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::Plain(resp) = reply else { panic!("expected a plain reply") };
    assert_eq!(encode(resp), b"KICKED 1\r\n");
}

#[tokio::test]
async fn watch_and_ignore_track_the_watch_set_size() {
    let (broker, _task) = new_broker();
    let conn = broker.connect().await;

    let (cmd, body) = parse_one(b"watch other\r\n").await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::Plain(resp) = reply else { panic!("expected a plain reply") };
    assert_eq!(encode(resp), b"WATCHING 2\r\n");

    let (cmd, body) = parse_one(b"ignore default\r\n").await;
    let reply = broker.command(conn, cmd, body).await;
    let BrokerReply::Plain(resp) = reply else { panic!("expected a plain reply") };
    assert_eq!(encode(resp), b"WATCHING 1\r\n");
}

#[tokio::test]
async fn unknown_command_is_rejected_by_the_decoder_before_reaching_the_broker() {
    let decoder: Decoder = Default::default();
    let mut framed = FramedRead::new(&b"frobnicate\r\n"[..], decoder);
    let err = framed.next().await.unwrap().unwrap_err();
    assert!(matches!(err, qbroker::wire::decoder::Error::Client(Response::UnknownCommand)));
}
