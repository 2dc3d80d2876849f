// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! End-to-end tests against an in-process scripted daemon.
//!
//! Each test spawns one server task per connection, speaking the daemon
//! side of the protocol over a duplex pipe (or a real Unix socket, at the
//! end), and asserts both what the client returns and what the daemon saw.

mod utils;

use nix_remote_store::daemon::{wire, Connect, DaemonClientBuilder};
use nix_remote_store::{
    ActivityType, BuildMode, BuildStatus, CaMethod, ClientSettings, ContentAddress, DaemonError,
    Error, GcOptions, HashAlgo, Logger, LoggerField, Missing, NarCopy, PathWithOutputs,
    Passthrough, Result, ResultType, Store, StorePath, ValidPathInfo, Verbosity,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use utils::init_logging;

/// The version this client announces: 1.25.
const CLIENT_PROTO: u64 = 0x0119;

const NAR_HASH: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

#[derive(Default)]
struct TestStore {
    cache_clears: AtomicUsize,
}

impl Store for TestStore {
    fn parse_store_path(&self, s: &str) -> Result<StorePath> {
        if s.starts_with("/store/") {
            Ok(StorePath::new(s))
        } else {
            Err(Error::Protocol(format!("'{}' is not a store path", s)))
        }
    }

    fn print_store_path(&self, path: &StorePath) -> String {
        path.as_str().into()
    }

    fn parse_content_address(&self, s: &str) -> Result<ContentAddress> {
        Ok(ContentAddress::new(s))
    }

    fn render_content_address(&self, ca: &ContentAddress) -> String {
        ca.as_str().into()
    }

    async fn derivation_output_map(
        &self,
        path: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>> {
        Ok([(
            "out".to_string(),
            Some(StorePath::new(format!("{}-out", path))),
        )]
        .into())
    }

    async fn query_missing(&self, targets: &[PathWithOutputs]) -> Result<Missing> {
        Ok(Missing {
            will_build: targets.iter().map(|t| t.path.clone()).collect(),
            download_size: 7,
            nar_size: 9,
            ..Missing::default()
        })
    }

    fn clear_path_info_cache(&self) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Line(Verbosity, String),
    Start(u64, ActivityType, String),
    Stop(u64),
    Result(u64, ResultType),
}

#[derive(Default)]
struct RecordingLogger {
    events: Mutex<Vec<Event>>,
}

impl RecordingLogger {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Verbosity, msg: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Line(level, msg.into()));
    }

    fn start_activity(
        &self,
        id: u64,
        _level: Verbosity,
        kind: ActivityType,
        text: &str,
        _fields: &[LoggerField],
        _parent: u64,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Start(id, kind, text.into()));
    }

    fn stop_activity(&self, id: u64) {
        self.events.lock().unwrap().push(Event::Stop(id));
    }

    fn result(&self, id: u64, kind: ResultType, _fields: &[LoggerField]) {
        self.events.lock().unwrap().push(Event::Result(id, kind));
    }
}

/// [`NarCopy`] for the tests: archives are a u64 length followed by that
/// many bytes, so the copier can find the end on an open stream.
struct LenPrefixed;

impl NarCopy for LenPrefixed {
    async fn copy<R, W>(&self, from: &mut R, to: &mut W) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut header = [0u8; 8];
        from.read_exact(&mut header).await?;
        let len = u64::from_le_bytes(header);
        let mut buf = vec![0u8; len as usize];
        from.read_exact(&mut buf).await?;
        to.write_all(&header).await?;
        to.write_all(&buf).await?;
        Ok(len + 8)
    }
}

type Script =
    Arc<dyn Fn(DuplexStream, usize) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Transport that spawns one scripted daemon task per connection.
struct ScriptedConnector {
    connections: Arc<AtomicUsize>,
    script: Script,
}

fn scripted<F, Fut>(f: F) -> ScriptedConnector
where
    F: Fn(DuplexStream, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    ScriptedConnector {
        connections: Arc::new(AtomicUsize::new(0)),
        script: Arc::new(move |stream, idx| Box::pin(f(stream, idx))),
    }
}

impl Connect for ScriptedConnector {
    type Stream = DuplexStream;

    async fn connect(&self) -> std::io::Result<DuplexStream> {
        let idx = self.connections.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn((self.script)(server, idx));
        Ok(client)
    }

    fn uri(&self) -> String {
        "daemon".into()
    }
}

async fn write_last<S: AsyncWrite + Unpin>(conn: &mut S) {
    wire::write_u64(conn, wire::StderrTag::Last.into())
        .await
        .unwrap();
}

/// Speaks the daemon side of the greeting and consumes the option upload,
/// returning the options header scalars and the override map.
async fn serve_handshake<S>(conn: &mut S, minor: u8) -> (Vec<u64>, HashMap<String, String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    assert_eq!(wire::WORKER_MAGIC_1, wire::read_u64(conn).await.unwrap());
    wire::write_u64(conn, wire::WORKER_MAGIC_2).await.unwrap();
    wire::write_u64(conn, (1 << 8) | minor as u64).await.unwrap();
    assert_eq!(CLIENT_PROTO, wire::read_u64(conn).await.unwrap());
    if minor >= 14 {
        assert_eq!(0, wire::read_u64(conn).await.unwrap()); // no cpu pin
    }
    if minor >= 11 {
        assert_eq!(0, wire::read_u64(conn).await.unwrap()); // reserved
    }
    write_last(conn).await;

    assert_eq!(
        u64::from(wire::Op::SetOptions),
        wire::read_u64(conn).await.unwrap()
    );
    let mut header = Vec::new();
    for _ in 0..12 {
        header.push(wire::read_u64(conn).await.unwrap());
    }
    let mut overrides = HashMap::new();
    if minor >= 12 {
        let count = wire::read_u64(conn).await.unwrap();
        for _ in 0..count {
            let name = wire::read_string(conn).await.unwrap();
            let value = wire::read_string(conn).await.unwrap();
            overrides.insert(name, value);
        }
    }
    write_last(conn).await;
    (header, overrides)
}

async fn write_path_info_body<S: AsyncWrite + Unpin>(
    conn: &mut S,
    minor: u8,
    deriver: &str,
    nar_hash: &str,
    references: &[&str],
    registration_time: u64,
    nar_size: u64,
    ultimate: bool,
    sigs: &[&str],
    ca: &str,
) {
    wire::write_string(conn, deriver).await.unwrap();
    wire::write_string(conn, nar_hash).await.unwrap();
    wire::write_strings(conn, references).await.unwrap();
    wire::write_u64(conn, registration_time).await.unwrap();
    wire::write_u64(conn, nar_size).await.unwrap();
    if minor >= 16 {
        wire::write_u64(conn, ultimate as u64).await.unwrap();
        wire::write_strings(conn, sigs).await.unwrap();
        wire::write_string(conn, ca).await.unwrap();
    }
}

#[tokio::test]
async fn test_is_valid_path() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::IsValidPath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!("/store/aaa-x", wire::read_string(&mut conn).await.unwrap());
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);
    assert!(client
        .is_valid_path(&StorePath::new("/store/aaa-x"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_query_path_info() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 20).await;
        assert_eq!(
            u64::from(wire::Op::QueryPathInfo),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!("/store/aaa-x", wire::read_string(&mut conn).await.unwrap());
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap(); // valid
        write_path_info_body(
            &mut conn,
            20,
            "",
            NAR_HASH,
            &["/store/bbb-y"],
            123,
            456,
            true,
            &["k:s"],
            "",
        )
        .await;
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);
    let info = client
        .query_path_info(&StorePath::new("/store/aaa-x"))
        .await
        .unwrap();
    assert_eq!("/store/aaa-x", info.path.as_str());
    assert_eq!(None, info.deriver);
    assert_eq!(NAR_HASH, info.nar_hash);
    assert_eq!(
        [StorePath::new("/store/bbb-y")].into_iter().collect::<BTreeSet<_>>(),
        info.references
    );
    assert_eq!(123, info.registration_time.timestamp());
    assert_eq!(456, info.nar_size);
    assert!(info.ultimate);
    assert_eq!(
        ["k:s".to_string()].into_iter().collect::<BTreeSet<_>>(),
        info.sigs
    );
    assert_eq!(None, info.ca);
}

#[tokio::test]
async fn test_query_path_info_invalid_keeps_connection() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 17).await;
        assert_eq!(
            u64::from(wire::Op::QueryPathInfo),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 0).await.unwrap(); // not valid

        // The same connection must serve the next request.
        assert_eq!(
            u64::from(wire::Op::IsValidPath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
    });
    let connections = connector.connections.clone();
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let path = StorePath::new("/store/aaa-x");
    match client.query_path_info(&path).await {
        Err(Error::InvalidPath(p)) => assert_eq!("/store/aaa-x", p),
        other => panic!("expected InvalidPath, got {:?}", other),
    }
    assert!(client.is_valid_path(&path).await.unwrap());
    assert_eq!(1, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_query_path_info_legacy_invalid_message() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 16).await;
        assert_eq!(
            u64::from(wire::Op::QueryPathInfo),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        wire::write_u64(&mut conn, wire::StderrTag::Error.into())
            .await
            .unwrap();
        wire::write_string(&mut conn, "path '/store/aaa-x' is not valid")
            .await
            .unwrap();
        wire::write_u64(&mut conn, 1).await.unwrap();
        write_last(&mut conn).await;
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);
    let err = client
        .query_path_info(&StorePath::new("/store/aaa-x"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidPath(_)));
}

#[tokio::test]
async fn test_add_ca_to_store_framed() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();
    let connector = scripted(move |mut conn, _idx| {
        let seen = seen_by_server.clone();
        async move {
            serve_handshake(&mut conn, 25).await;
            assert_eq!(
                u64::from(wire::Op::AddToStore),
                wire::read_u64(&mut conn).await.unwrap()
            );
            assert_eq!("x", wire::read_string(&mut conn).await.unwrap());
            assert_eq!("fixed:r:sha256", wire::read_string(&mut conn).await.unwrap());
            assert_eq!(0, wire::read_u64(&mut conn).await.unwrap()); // references
            assert_eq!(0, wire::read_u64(&mut conn).await.unwrap()); // repair

            let mut collected = Vec::new();
            loop {
                let len = wire::read_u64(&mut conn).await.unwrap();
                if len == 0 {
                    break;
                }
                let mut buf = vec![0u8; len as usize];
                conn.read_exact(&mut buf).await.unwrap();
                collected.extend_from_slice(&buf);
            }
            *seen.lock().unwrap() = collected;

            write_last(&mut conn).await;
            wire::write_string(&mut conn, "/store/ccc-x").await.unwrap();
            write_path_info_body(&mut conn, 25, "", NAR_HASH, &[], 123, 456, false, &[], "").await;
        }
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let payload = b"not actually an archive, but close enough".to_vec();
    let mut dump = Cursor::new(payload.clone());
    let info = client
        .add_ca_to_store(
            &mut dump,
            "x",
            CaMethod::Recursive(HashAlgo::Sha256),
            &BTreeSet::new(),
            false,
        )
        .await
        .unwrap();
    assert_eq!("/store/ccc-x", info.path.as_str());
    assert_eq!(payload, *seen.lock().unwrap());
}

#[tokio::test]
async fn test_add_ca_to_store_framed_daemon_error() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::AddToStore),
            wire::read_u64(&mut conn).await.unwrap()
        );
        for _ in 0..2 {
            let _ = wire::read_string(&mut conn).await.unwrap();
        }
        assert_eq!(0, wire::read_u64(&mut conn).await.unwrap());
        assert_eq!(0, wire::read_u64(&mut conn).await.unwrap());
        loop {
            let len = wire::read_u64(&mut conn).await.unwrap();
            if len == 0 {
                break;
            }
            let mut buf = vec![0u8; len as usize];
            conn.read_exact(&mut buf).await.unwrap();
        }
        wire::write_u64(&mut conn, wire::StderrTag::Error.into())
            .await
            .unwrap();
        wire::write_string(&mut conn, "refusing").await.unwrap();
        wire::write_u64(&mut conn, 1).await.unwrap();
        write_last(&mut conn).await;

        // Still in sync: serve a follow-up request.
        assert_eq!(
            u64::from(wire::Op::IsValidPath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
    });
    let connections = connector.connections.clone();
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let mut dump = Cursor::new(b"payload".to_vec());
    let err = client
        .add_ca_to_store(
            &mut dump,
            "x",
            CaMethod::Recursive(HashAlgo::Sha256),
            &BTreeSet::new(),
            false,
        )
        .await
        .err()
        .unwrap();
    match err {
        Error::Daemon(err) => assert_eq!("refusing", err.msg),
        other => panic!("expected a daemon error, got {:?}", other),
    }

    assert!(client
        .is_valid_path(&StorePath::new("/store/aaa-x"))
        .await
        .unwrap());
    assert_eq!(1, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_add_ca_to_store_legacy_text() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 20).await;
        assert_eq!(
            u64::from(wire::Op::AddTextToStore),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!("hello.txt", wire::read_string(&mut conn).await.unwrap());
        assert_eq!("hello world", wire::read_string(&mut conn).await.unwrap());
        assert_eq!(0, wire::read_u64(&mut conn).await.unwrap()); // references
        write_last(&mut conn).await;
        wire::write_string(&mut conn, "/store/ddd-hello.txt")
            .await
            .unwrap();

        // The follow-up metadata query arrives on the same connection.
        assert_eq!(
            u64::from(wire::Op::QueryPathInfo),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(
            "/store/ddd-hello.txt",
            wire::read_string(&mut conn).await.unwrap()
        );
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
        write_path_info_body(&mut conn, 20, "", NAR_HASH, &[], 123, 456, false, &[], "").await;
    });
    let connections = connector.connections.clone();
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let path = client
        .add_text_to_store("hello.txt", "hello world", &BTreeSet::new(), false)
        .await
        .unwrap();
    assert_eq!("/store/ddd-hello.txt", path.as_str());
    assert_eq!(1, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_add_ca_to_store_legacy_rejects_repair() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 20).await;
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);
    let mut dump = Cursor::new(Vec::new());
    let err = client
        .add_ca_to_store(
            &mut dump,
            "x",
            CaMethod::Flat(HashAlgo::Sha256),
            &BTreeSet::new(),
            true,
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_daemon_error_keeps_connection() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::EnsurePath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        wire::write_u64(&mut conn, wire::StderrTag::Next.into())
            .await
            .unwrap();
        wire::write_string(&mut conn, "warning\n").await.unwrap();
        wire::write_u64(&mut conn, wire::StderrTag::Error.into())
            .await
            .unwrap();
        wire::write_string(&mut conn, "boom").await.unwrap();
        wire::write_u64(&mut conn, 2).await.unwrap();
        write_last(&mut conn).await;

        assert_eq!(
            u64::from(wire::Op::IsValidPath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
    });
    let connections = connector.connections.clone();
    let logger = Arc::new(RecordingLogger::default());
    let client = DaemonClientBuilder::new()
        .logger(logger.clone())
        .build_with(TestStore::default(), connector);

    let path = StorePath::new("/store/aaa-x");
    let err = client.ensure_path(&path).await.err().unwrap();
    match err {
        Error::Daemon(err) => {
            assert_eq!(
                DaemonError {
                    msg: "boom".into(),
                    status: 2
                },
                err
            );
        }
        other => panic!("expected a daemon error, got {:?}", other),
    }
    assert_eq!(
        vec![Event::Line(Verbosity::Error, "warning".into())],
        logger.events()
    );

    assert!(client.is_valid_path(&path).await.unwrap());
    assert_eq!(1, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_logger_sees_activities_in_order() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::EnsurePath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();

        wire::write_u64(&mut conn, wire::StderrTag::StartActivity.into())
            .await
            .unwrap();
        wire::write_u64(&mut conn, 11).await.unwrap(); // id
        wire::write_u64(&mut conn, 0).await.unwrap(); // level = error
        wire::write_u64(&mut conn, 105).await.unwrap(); // kind = build
        wire::write_string(&mut conn, "building").await.unwrap();
        wire::write_u64(&mut conn, 1).await.unwrap(); // one field
        wire::write_u64(&mut conn, 0).await.unwrap(); // int
        wire::write_u64(&mut conn, 42).await.unwrap();
        wire::write_u64(&mut conn, 0).await.unwrap(); // parent

        wire::write_u64(&mut conn, wire::StderrTag::Result.into())
            .await
            .unwrap();
        wire::write_u64(&mut conn, 11).await.unwrap();
        wire::write_u64(&mut conn, 101).await.unwrap(); // build log line
        wire::write_u64(&mut conn, 0).await.unwrap(); // no fields

        wire::write_u64(&mut conn, wire::StderrTag::StopActivity.into())
            .await
            .unwrap();
        wire::write_u64(&mut conn, 11).await.unwrap();

        wire::write_u64(&mut conn, wire::StderrTag::Next.into())
            .await
            .unwrap();
        wire::write_string(&mut conn, "done\n").await.unwrap();

        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 0).await.unwrap();
    });
    let logger = Arc::new(RecordingLogger::default());
    let client = DaemonClientBuilder::new()
        .logger(logger.clone())
        .build_with(TestStore::default(), connector);

    client
        .ensure_path(&StorePath::new("/store/aaa-x"))
        .await
        .unwrap();
    assert_eq!(
        vec![
            Event::Start(11, ActivityType::Build, "building".into()),
            Event::Result(11, ResultType::BuildLogLine),
            Event::Stop(11),
            Event::Line(Verbosity::Error, "done".into()),
        ],
        logger.events()
    );
}

#[tokio::test]
async fn test_concurrent_requests_use_two_connections() {
    init_logging();
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let server_barrier = barrier.clone();
    let connector = scripted(move |mut conn, _idx| {
        let barrier = server_barrier.clone();
        async move {
            serve_handshake(&mut conn, 25).await;
            // Both connections must be open at the same time.
            barrier.wait().await;
            assert_eq!(
                u64::from(wire::Op::IsValidPath),
                wire::read_u64(&mut conn).await.unwrap()
            );
            let path = wire::read_string(&mut conn).await.unwrap();
            write_last(&mut conn).await;
            wire::write_u64(&mut conn, path.ends_with("-a") as u64)
                .await
                .unwrap();
        }
    });
    let connections = connector.connections.clone();
    let client = DaemonClientBuilder::new()
        .max_connections(2)
        .build_with(TestStore::default(), connector);

    let a = StorePath::new("/store/aaa-a");
    let b = StorePath::new("/store/bbb-b");
    let (ra, rb) = tokio::join!(client.is_valid_path(&a), client.is_valid_path(&b));
    assert!(ra.unwrap());
    assert!(!rb.unwrap());
    assert_eq!(2, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_protocol_error_drops_connection() {
    init_logging();
    let connector = scripted(|mut conn, idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::IsValidPath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        if idx == 0 {
            // Nonsense tag; the client must junk this connection.
            wire::write_u64(&mut conn, 0xdead).await.unwrap();
        } else {
            write_last(&mut conn).await;
            wire::write_u64(&mut conn, 1).await.unwrap();
        }
    });
    let connections = connector.connections.clone();
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let path = StorePath::new("/store/aaa-x");
    let err = client.is_valid_path(&path).await.err().unwrap();
    assert!(matches!(err, Error::Protocol(_)));

    assert!(client.is_valid_path(&path).await.unwrap());
    assert_eq!(2, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_handshake_failure_poisons_client() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        assert_eq!(wire::WORKER_MAGIC_1, wire::read_u64(&mut conn).await.unwrap());
        wire::write_u64(&mut conn, 0x12345678).await.unwrap();
    });
    let connections = connector.connections.clone();
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let err = client.connect().await.err().unwrap();
    match err {
        Error::Protocol(msg) => {
            assert!(msg.contains("cannot open connection to remote store 'daemon'"));
            assert!(msg.contains("magic2"));
        }
        other => panic!("expected a wrapped handshake error, got {:?}", other),
    }

    // No second connection attempt is made.
    let err = client
        .is_valid_path(&StorePath::new("/store/aaa-x"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::PoolFailed(_)));
    assert_eq!(1, connections.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_options_upload() {
    init_logging();
    let captured = Arc::new(Mutex::new(None));
    let captured_by_server = captured.clone();
    let connector = scripted(move |mut conn, _idx| {
        let captured = captured_by_server.clone();
        async move {
            let options = serve_handshake(&mut conn, 25).await;
            *captured.lock().unwrap() = Some(options);
        }
    });

    let mut settings = ClientSettings {
        keep_failed: true,
        keep_going: false,
        try_fallback: true,
        verbosity: Verbosity::Vomit,
        max_build_jobs: 4,
        max_silent_time: 60,
        verbose_build: false,
        build_cores: 2,
        use_substitutes: false,
        ..ClientSettings::default()
    };
    settings
        .overrides
        .insert("narinfo-cache-ttl".into(), "3600".into());
    // Owned by the header; must not be repeated as an override.
    settings.overrides.insert("cores".into(), "8".into());
    settings.overrides.insert("show-trace".into(), "true".into());

    let client = DaemonClientBuilder::new()
        .settings(settings)
        .build_with(TestStore::default(), connector);
    client.connect().await.unwrap();

    let (header, overrides) = captured.lock().unwrap().clone().unwrap();
    assert_eq!(
        vec![
            1, // keep_failed
            0, // keep_going
            1, // try_fallback
            7, // verbosity = vomit
            4, // max_build_jobs
            60, // max_silent_time
            1, // historical use-build-hook, always true
            7, // build verbosity = vomit (verbose_build off)
            0, // obsolete log type
            0, // obsolete print build trace
            2, // build_cores
            0, // use_substitutes
        ],
        header
    );
    assert_eq!(
        HashMap::from([("narinfo-cache-ttl".to_string(), "3600".to_string())]),
        overrides
    );
}

#[tokio::test]
async fn test_query_valid_paths_legacy_loop() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 11).await;
        for _ in 0..2 {
            assert_eq!(
                u64::from(wire::Op::IsValidPath),
                wire::read_u64(&mut conn).await.unwrap()
            );
            let path = wire::read_string(&mut conn).await.unwrap();
            write_last(&mut conn).await;
            wire::write_u64(&mut conn, path.ends_with("-a") as u64)
                .await
                .unwrap();
        }
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let paths: BTreeSet<StorePath> = [
        StorePath::new("/store/aaa-a"),
        StorePath::new("/store/bbb-b"),
    ]
    .into();
    let valid = client.query_valid_paths(&paths, false).await.unwrap();
    assert_eq!(
        [StorePath::new("/store/aaa-a")].into_iter().collect::<BTreeSet<_>>(),
        valid
    );
}

#[tokio::test]
async fn test_query_substitutable_path_infos() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::QuerySubstitutablePathInfos),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(1, wire::read_u64(&mut conn).await.unwrap()); // map size
        assert_eq!("/store/aaa-x", wire::read_string(&mut conn).await.unwrap());
        assert_eq!("", wire::read_string(&mut conn).await.unwrap()); // no ca
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
        wire::write_string(&mut conn, "/store/aaa-x").await.unwrap();
        wire::write_string(&mut conn, "/store/aaa-x.drv").await.unwrap();
        wire::write_strings(&mut conn, ["/store/bbb-y"]).await.unwrap();
        wire::write_u64(&mut conn, 11).await.unwrap();
        wire::write_u64(&mut conn, 22).await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let mut query = BTreeMap::new();
    query.insert(StorePath::new("/store/aaa-x"), None);
    let infos = client.query_substitutable_path_infos(&query).await.unwrap();
    let info = &infos[&StorePath::new("/store/aaa-x")];
    assert_eq!(Some(StorePath::new("/store/aaa-x.drv")), info.deriver);
    assert_eq!(11, info.download_size);
    assert_eq!(22, info.nar_size);
}

#[tokio::test]
async fn test_query_derivation_output_map() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::QueryDerivationOutputMap),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(
            "/store/aaa-x.drv",
            wire::read_string(&mut conn).await.unwrap()
        );
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 2).await.unwrap();
        wire::write_string(&mut conn, "dev").await.unwrap();
        wire::write_string(&mut conn, "").await.unwrap();
        wire::write_string(&mut conn, "out").await.unwrap();
        wire::write_string(&mut conn, "/store/eee-out").await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let map = client
        .query_partial_derivation_output_map(&StorePath::new("/store/aaa-x.drv"))
        .await
        .unwrap();
    assert_eq!(None, map["dev"]);
    assert_eq!(Some(StorePath::new("/store/eee-out")), map["out"]);
}

#[tokio::test]
async fn test_query_derivation_outputs_via_output_map() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::QueryDerivationOutputMap),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 2).await.unwrap();
        wire::write_string(&mut conn, "dev").await.unwrap();
        wire::write_string(&mut conn, "").await.unwrap();
        wire::write_string(&mut conn, "out").await.unwrap();
        wire::write_string(&mut conn, "/store/eee-out").await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let outputs = client
        .query_derivation_outputs(&StorePath::new("/store/aaa-x.drv"))
        .await
        .unwrap();
    assert_eq!(
        [StorePath::new("/store/eee-out")].into_iter().collect::<BTreeSet<_>>(),
        outputs
    );
}

#[tokio::test]
async fn test_query_derivation_outputs_legacy_opcode() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 21).await;
        assert_eq!(
            u64::from(wire::Op::QueryDerivationOutputs),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_strings(&mut conn, ["/store/eee-out"]).await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let outputs = client
        .query_derivation_outputs(&StorePath::new("/store/aaa-x.drv"))
        .await
        .unwrap();
    assert_eq!(
        [StorePath::new("/store/eee-out")].into_iter().collect::<BTreeSet<_>>(),
        outputs
    );
}

#[tokio::test]
async fn test_output_map_falls_back_to_store() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 21).await;
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let map = client
        .query_partial_derivation_output_map(&StorePath::new("/store/aaa-x.drv"))
        .await
        .unwrap();
    assert_eq!(
        Some(StorePath::new("/store/aaa-x.drv-out")),
        map["out"]
    );
}

#[tokio::test]
async fn test_query_missing() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::QueryMissing),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(1, wire::read_u64(&mut conn).await.unwrap());
        assert_eq!(
            "/store/aaa-x.drv!out",
            wire::read_string(&mut conn).await.unwrap()
        );
        write_last(&mut conn).await;
        wire::write_strings(&mut conn, ["/store/aaa-x.drv"]).await.unwrap(); // will build
        wire::write_strings(&mut conn, ["/store/bbb-y"]).await.unwrap(); // will substitute
        wire::write_u64(&mut conn, 0).await.unwrap(); // unknown
        wire::write_u64(&mut conn, 100).await.unwrap();
        wire::write_u64(&mut conn, 200).await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let targets = [PathWithOutputs {
        path: StorePath::new("/store/aaa-x.drv"),
        outputs: ["out".to_string()].into(),
    }];
    let missing = client.query_missing(&targets).await.unwrap();
    assert_eq!(
        [StorePath::new("/store/aaa-x.drv")].into_iter().collect::<BTreeSet<_>>(),
        missing.will_build
    );
    assert_eq!(100, missing.download_size);
    assert_eq!(200, missing.nar_size);
}

#[tokio::test]
async fn test_query_missing_falls_back_to_store() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 18).await;
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let targets = [PathWithOutputs {
        path: StorePath::new("/store/aaa-x.drv"),
        outputs: BTreeSet::new(),
    }];
    let missing = client.query_missing(&targets).await.unwrap();
    assert_eq!(
        [StorePath::new("/store/aaa-x.drv")].into_iter().collect::<BTreeSet<_>>(),
        missing.will_build
    );
    assert_eq!(7, missing.download_size);
    assert_eq!(9, missing.nar_size);
}

#[tokio::test]
async fn test_build_paths() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::BuildPaths),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(1, wire::read_u64(&mut conn).await.unwrap());
        assert_eq!(
            "/store/aaa-x.drv",
            wire::read_string(&mut conn).await.unwrap()
        );
        assert_eq!(0, wire::read_u64(&mut conn).await.unwrap()); // normal build
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let targets = [PathWithOutputs {
        path: StorePath::new("/store/aaa-x.drv"),
        outputs: BTreeSet::new(),
    }];
    client
        .build_paths(&targets, BuildMode::Normal)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_build_derivation() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::BuildDerivation),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(
            "/store/aaa-x.drv",
            wire::read_string(&mut conn).await.unwrap()
        );
        // Serialized derivation body, spliced in by the caller.
        assert_eq!("drv body", wire::read_string(&mut conn).await.unwrap());
        assert_eq!(2, wire::read_u64(&mut conn).await.unwrap()); // check mode
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 6).await.unwrap(); // transient failure
        wire::write_string(&mut conn, "builder ran out of tea")
            .await
            .unwrap();
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    // The store layer would produce this; here it is just a wire string.
    let mut drv_wire = Vec::new();
    wire::write_string(&mut drv_wire, "drv body").await.unwrap();

    let result = client
        .build_derivation(
            &StorePath::new("/store/aaa-x.drv"),
            &drv_wire,
            BuildMode::Check,
        )
        .await
        .unwrap();
    assert_eq!(BuildStatus::TransientFailure, result.status);
    assert_eq!("builder ran out of tea", result.error_msg);
}

#[tokio::test]
async fn test_collect_garbage_clears_path_info_cache() {
    init_logging();
    let connector = scripted(|mut conn, _idx| async move {
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::CollectGarbage),
            wire::read_u64(&mut conn).await.unwrap()
        );
        assert_eq!(2, wire::read_u64(&mut conn).await.unwrap()); // delete dead
        assert_eq!(0, wire::read_u64(&mut conn).await.unwrap()); // no explicit paths
        assert_eq!(0, wire::read_u64(&mut conn).await.unwrap()); // ignore_liveness
        assert_eq!(u64::MAX, wire::read_u64(&mut conn).await.unwrap());
        for _ in 0..3 {
            assert_eq!(0, wire::read_u64(&mut conn).await.unwrap());
        }
        write_last(&mut conn).await;
        wire::write_strings(&mut conn, ["/store/dead-1"]).await.unwrap();
        wire::write_u64(&mut conn, 12345).await.unwrap();
        wire::write_u64(&mut conn, 0).await.unwrap(); // obsolete
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let results = client.collect_garbage(&GcOptions::default()).await.unwrap();
    assert_eq!(12345, results.bytes_freed);
    assert!(results.paths.contains("/store/dead-1"));
    assert_eq!(1, client.store().cache_clears.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_add_to_store_nar_pull() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();
    let connector = scripted(move |mut conn, _idx| {
        let seen = seen_by_server.clone();
        async move {
            serve_handshake(&mut conn, 21).await;
            read_add_to_store_nar_header(&mut conn).await;

            // Pull the NAR through read requests.
            let mut collected = Vec::new();
            loop {
                wire::write_u64(&mut conn, wire::StderrTag::Read.into())
                    .await
                    .unwrap();
                wire::write_u64(&mut conn, 1024).await.unwrap();
                let chunk = wire::read_bytes(&mut conn).await.unwrap();
                if chunk.is_empty() {
                    break;
                }
                collected.extend_from_slice(&chunk);
            }
            *seen.lock().unwrap() = collected;
            write_last(&mut conn).await;
        }
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let payload = b"nar bytes".to_vec();
    let mut source = Cursor::new(payload.clone());
    client
        .add_to_store(&path_info(), &mut source, &Passthrough, false, true)
        .await
        .unwrap();
    assert_eq!(payload, *seen.lock().unwrap());
}

#[tokio::test]
async fn test_add_to_store_nar_framed() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();
    let connector = scripted(move |mut conn, _idx| {
        let seen = seen_by_server.clone();
        async move {
            serve_handshake(&mut conn, 23).await;
            read_add_to_store_nar_header(&mut conn).await;

            let mut collected = Vec::new();
            loop {
                let len = wire::read_u64(&mut conn).await.unwrap();
                if len == 0 {
                    break;
                }
                let mut buf = vec![0u8; len as usize];
                conn.read_exact(&mut buf).await.unwrap();
                collected.extend_from_slice(&buf);
            }
            *seen.lock().unwrap() = collected;
            write_last(&mut conn).await;
        }
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let payload = b"framed nar bytes".to_vec();
    let mut source = Cursor::new(payload.clone());
    client
        .add_to_store(&path_info(), &mut source, &Passthrough, false, true)
        .await
        .unwrap();
    assert_eq!(payload, *seen.lock().unwrap());
}

#[tokio::test]
async fn test_add_to_store_legacy_import() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = seen.clone();
    let connector = scripted(move |mut conn, _idx| {
        let seen = seen_by_server.clone();
        async move {
            serve_handshake(&mut conn, 17).await;
            assert_eq!(
                u64::from(wire::Op::ImportPaths),
                wire::read_u64(&mut conn).await.unwrap()
            );

            // Pull the whole export stream.
            let mut collected = Vec::new();
            loop {
                wire::write_u64(&mut conn, wire::StderrTag::Read.into())
                    .await
                    .unwrap();
                wire::write_u64(&mut conn, 4096).await.unwrap();
                let chunk = wire::read_bytes(&mut conn).await.unwrap();
                if chunk.is_empty() {
                    break;
                }
                collected.extend_from_slice(&chunk);
            }
            *seen.lock().unwrap() = collected;
            write_last(&mut conn).await;
            wire::write_strings(&mut conn, ["/store/fff-z"]).await.unwrap();
        }
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let payload = b"export nar".to_vec();
    let mut nar = Vec::new();
    wire::write_u64(&mut nar, payload.len() as u64).await.unwrap();
    nar.extend_from_slice(&payload);
    let mut source = Cursor::new(nar);
    client
        .add_to_store(&path_info(), &mut source, &LenPrefixed, false, true)
        .await
        .unwrap();

    // The export stream starts with the "path follows" marker and carries
    // the NAR (here: the length-prefixed test archive) inline.
    let collected = seen.lock().unwrap().clone();
    assert_eq!(1, u64::from_le_bytes(collected[0..8].try_into().unwrap()));
    assert_eq!(
        payload.len() as u64,
        u64::from_le_bytes(collected[8..16].try_into().unwrap())
    );
    assert_eq!(&payload[..], &collected[16..16 + payload.len()]);
}

#[tokio::test]
async fn test_nar_from_path() {
    init_logging();
    let payload = b"here is your archive".to_vec();
    let served = payload.clone();
    let connector = scripted(move |mut conn, _idx| {
        let payload = served.clone();
        async move {
            serve_handshake(&mut conn, 25).await;
            assert_eq!(
                u64::from(wire::Op::NarFromPath),
                wire::read_u64(&mut conn).await.unwrap()
            );
            assert_eq!("/store/aaa-x", wire::read_string(&mut conn).await.unwrap());
            write_last(&mut conn).await;
            wire::write_u64(&mut conn, payload.len() as u64)
                .await
                .unwrap();
            conn.write_all(&payload).await.unwrap();
        }
    });
    let client = DaemonClientBuilder::new().build_with(TestStore::default(), connector);

    let mut sink = Vec::new();
    client
        .nar_from_path(&StorePath::new("/store/aaa-x"), &mut sink, &LenPrefixed)
        .await
        .unwrap();
    let mut expected = Vec::new();
    expected.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    expected.extend_from_slice(&payload);
    assert_eq!(expected, sink);
}

async fn read_add_to_store_nar_header<S>(conn: &mut S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    assert_eq!(
        u64::from(wire::Op::AddToStoreNar),
        wire::read_u64(conn).await.unwrap()
    );
    assert_eq!("/store/aaa-x", wire::read_string(conn).await.unwrap());
    assert_eq!("", wire::read_string(conn).await.unwrap()); // deriver
    assert_eq!(NAR_HASH, wire::read_string(conn).await.unwrap());
    assert_eq!(0, wire::read_u64(conn).await.unwrap()); // references
    assert_eq!(123, wire::read_u64(conn).await.unwrap()); // registration time
    assert_eq!(456, wire::read_u64(conn).await.unwrap()); // nar size
    assert_eq!(0, wire::read_u64(conn).await.unwrap()); // ultimate
    assert_eq!(0, wire::read_u64(conn).await.unwrap()); // sigs
    assert_eq!("", wire::read_string(conn).await.unwrap()); // ca
    assert_eq!(0, wire::read_u64(conn).await.unwrap()); // repair
    assert_eq!(0, wire::read_u64(conn).await.unwrap()); // !check_sigs
}

fn path_info() -> ValidPathInfo {
    ValidPathInfo {
        path: StorePath::new("/store/aaa-x"),
        deriver: None,
        nar_hash: NAR_HASH.into(),
        references: BTreeSet::new(),
        registration_time: chrono::DateTime::from_timestamp(123, 0).unwrap(),
        nar_size: 456,
        ultimate: false,
        sigs: BTreeSet::new(),
        ca: None,
    }
}

#[tokio::test]
async fn test_unix_socket_transport() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("daemon.sock");
    let listener = tokio::net::UnixListener::bind(&socket).unwrap();
    tokio::spawn(async move {
        let (mut conn, _addr) = listener.accept().await.unwrap();
        serve_handshake(&mut conn, 25).await;
        assert_eq!(
            u64::from(wire::Op::IsValidPath),
            wire::read_u64(&mut conn).await.unwrap()
        );
        let _path = wire::read_string(&mut conn).await.unwrap();
        write_last(&mut conn).await;
        wire::write_u64(&mut conn, 1).await.unwrap();
    });

    let client = DaemonClientBuilder::new()
        .socket_path(&socket)
        .build(TestStore::default());
    assert!(client
        .is_valid_path(&StorePath::new("/store/aaa-x"))
        .await
        .unwrap());
    let version = client.daemon_version().await.unwrap();
    assert_eq!(1, version.major());
    assert_eq!(25, version.minor());
}
