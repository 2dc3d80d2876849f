// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! Pooled client for the daemon worker protocol.
//! ----------------------------------------------
//!
//! [`DaemonClient`] owns a bounded pool of connections to one daemon. Each
//! request checks out a connection, writes an opcode and its arguments,
//! drains the interleaved stderr stream, reads the reply and checks the
//! connection back in. A request that fails anywhere else than a daemon
//! error message leaves the wire in an unknown position, so its connection
//! is discarded instead of reused.
//!
//! The client speaks protocol 1.25 and keeps the request variants needed by
//! every daemon down to minor 10.

mod framed;
mod pool;
pub mod wire;

use crate::{
    BuildMode, BuildResult, CaMethod, ClientSettings, ContentAddress, DaemonError, Error, GcOptions,
    GcResults, Logger, Missing, NarCopy, Passthrough, PathWithOutputs, Result, ResultExt, Store,
    StorePath, SubstitutablePathInfo, TracingLogger, ValidPathInfo, Verbosity,
};
use framed::FramedSink;
use parking_lot::Mutex;
use pool::{Pool, PoolGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tap::TapFallible;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Protocol version spoken by this client.
const PROTOCOL_VERSION: Proto = Proto(1, 25);
/// Oldest daemon minor we can still talk to.
const MIN_DAEMON_MINOR: u8 = 10;

/// Where the daemon listens when no socket path is given.
pub const DEFAULT_SOCKET_PATH: &str = "/nix/var/nix/daemon-socket/socket";

/// Settings expressed by dedicated fields of the options header; they must
/// not be repeated in the override map. `show-trace` is client-side only.
const HEADER_OWNED_SETTINGS: &[&str] = &[
    "keep-failed",
    "keep-going",
    "fallback",
    "max-jobs",
    "max-silent-time",
    "cores",
    "substitute",
    "show-trace",
];

/// Protocol version: a major and a minor packed into 16 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Proto(u8, u8);

impl From<u64> for Proto {
    fn from(raw: u64) -> Self {
        Self(((raw & 0xFF00) >> 8) as u8, (raw & 0x00FF) as u8)
    }
}
impl From<Proto> for u64 {
    fn from(v: Proto) -> Self {
        ((v.0 as u64) << 8) | (v.1 as u64)
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

impl Proto {
    pub fn major(&self) -> u8 {
        self.0
    }

    pub fn minor(&self) -> u8 {
        self.1
    }

    fn since(&self, v: u8) -> bool {
        self.1 >= v
    }
}

/// Opens the byte stream a [`DaemonClient`] talks through. The pool calls
/// [`Connect::connect`] whenever it needs a fresh connection.
pub trait Connect: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send;

    fn connect(&self) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;

    /// URI shown in diagnostics, eg. `unix:///run/nix/socket`.
    fn uri(&self) -> String;
}

/// Connects to the daemon over a Unix domain socket.
#[derive(Debug, Clone, Default)]
pub struct UnixConnector {
    path: Option<PathBuf>,
}

impl UnixConnector {
    /// `None` falls back to [`DEFAULT_SOCKET_PATH`].
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl Connect for UnixConnector {
    type Stream = UnixStream;

    async fn connect(&self) -> std::io::Result<UnixStream> {
        let path = self
            .path
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_SOCKET_PATH));
        UnixStream::connect(path).await
    }

    fn uri(&self) -> String {
        match &self.path {
            Some(path) => format!("unix://{}", path.display()),
            None => "daemon".into(),
        }
    }
}

type DynSink<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);
type DynSource<'a> = &'a mut (dyn AsyncRead + Unpin + Send);

/// One established, handshaked connection to the daemon.
///
/// Between requests both half-streams idle at a message boundary; every
/// request leaves them there again or gets its connection thrown away.
pub(crate) struct Connection<T> {
    from: BufReader<ReadHalf<T>>,
    to: BufWriter<WriteHalf<T>>,
    /// The version the daemon announced. Branches test this, knowing the
    /// daemon never uses features beyond our own 1.25.
    daemon_version: Proto,
    start_time: Instant,
}

impl<T: AsyncRead + AsyncWrite + Send> Connection<T> {
    /// Performs the greeting, version negotiation and option upload on a
    /// fresh stream.
    pub(crate) async fn init(
        stream: T,
        settings: &ClientSettings,
        logger: &dyn Logger,
    ) -> Result<Self> {
        let (r, w) = tokio::io::split(stream);
        let mut conn = Connection {
            from: BufReader::new(r),
            to: BufWriter::new(w),
            daemon_version: Proto(0, 0),
            start_time: Instant::now(),
        };
        conn.handshake(logger).await?;
        conn.set_options(settings, logger).await?;
        Ok(conn)
    }

    #[instrument(skip_all, level = "debug")]
    async fn handshake(&mut self, logger: &dyn Logger) -> Result<()> {
        wire::write_u64(&mut self.to, wire::WORKER_MAGIC_1)
            .await
            .with_field("magic1")?;
        self.to.flush().await?;
        match wire::read_u64(&mut self.from).await {
            Ok(wire::WORKER_MAGIC_2) => Ok(()),
            Ok(v) => Err(Error::Protocol(format!("protocol mismatch {:#x}", v))),
            Err(err) => Err(err.into()),
        }
        .with_field("magic2")?;

        let daemon = wire::read_proto(&mut self.from)
            .await
            .map_err(Error::from)
            .and_then(|proto| {
                if proto.major() != PROTOCOL_VERSION.major() {
                    return Err(Error::Protocol(format!(
                        "daemon protocol version {} not supported",
                        proto
                    )));
                }
                if proto.minor() < MIN_DAEMON_MINOR {
                    return Err(Error::Protocol(format!(
                        "the daemon version is too old (protocol {})",
                        proto
                    )));
                }
                Ok(proto)
            })
            .with_field("daemon_version")?;
        self.daemon_version = daemon;
        wire::write_proto(&mut self.to, PROTOCOL_VERSION)
            .await
            .with_field("client_version")?;

        if daemon.since(14) {
            // CPU pinning hint; advisory, and we never pin.
            wire::write_u64(&mut self.to, 0)
                .await
                .with_field("cpu_affinity")?;
        }
        if daemon.since(11) {
            // Historically the reserve-space flag.
            wire::write_bool(&mut self.to, false)
                .await
                .with_field("reserve_space")?;
        }

        self.process_stderr(None, None, logger, true).await?;
        debug!(version = %daemon, "daemon handshake complete");
        Ok(())
    }

    /// Uploads the client settings: a fixed header of legacy scalars, plus
    /// named overrides on daemons that accept them.
    #[instrument(skip_all, level = "debug")]
    async fn set_options(&mut self, settings: &ClientSettings, logger: &dyn Logger) -> Result<()> {
        let to = &mut self.to;
        wire::write_op(to, wire::Op::SetOptions)
            .await
            .with_field("SetOptions.<op>")?;
        wire::write_bool(to, settings.keep_failed)
            .await
            .with_field("SetOptions.keep_failed")?;
        wire::write_bool(to, settings.keep_going)
            .await
            .with_field("SetOptions.keep_going")?;
        wire::write_bool(to, settings.try_fallback)
            .await
            .with_field("SetOptions.try_fallback")?;
        wire::write_verbosity(to, settings.verbosity)
            .await
            .with_field("SetOptions.verbosity")?;
        wire::write_u64(to, settings.max_build_jobs)
            .await
            .with_field("SetOptions.max_build_jobs")?;
        wire::write_u64(to, settings.max_silent_time)
            .await
            .with_field("SetOptions.max_silent_time")?;
        // Obsolete use-build-hook flag; always true on the wire.
        wire::write_bool(to, true)
            .await
            .with_field("SetOptions.use_build_hook")?;
        wire::write_verbosity(
            to,
            if settings.verbose_build {
                Verbosity::Error
            } else {
                Verbosity::Vomit
            },
        )
        .await
        .with_field("SetOptions.build_verbosity")?;
        wire::write_u64(to, 0)
            .await
            .with_field("SetOptions.log_type")?;
        wire::write_u64(to, 0)
            .await
            .with_field("SetOptions.print_build_trace")?;
        wire::write_u64(to, settings.build_cores)
            .await
            .with_field("SetOptions.build_cores")?;
        wire::write_bool(to, settings.use_substitutes)
            .await
            .with_field("SetOptions.use_substitutes")?;

        if self.daemon_version.since(12) {
            let overrides: Vec<(&String, &String)> = settings
                .overrides
                .iter()
                .filter(|(name, _)| !HEADER_OWNED_SETTINGS.contains(&name.as_str()))
                .collect();
            let to = &mut self.to;
            wire::write_u64(to, overrides.len() as u64)
                .await
                .with_field("SetOptions.overrides.<count>")?;
            for (name, value) in overrides {
                wire::write_string(to, name)
                    .await
                    .with_field("SetOptions.overrides[].name")?;
                wire::write_string(to, value)
                    .await
                    .with_field("SetOptions.overrides[].value")?;
            }
        }

        self.process_stderr(None, None, logger, true).await
    }

    /// Drains the stderr stream until the daemon hands the wire back.
    pub(crate) async fn process_stderr(
        &mut self,
        sink: Option<DynSink<'_>>,
        source: Option<DynSource<'_>>,
        logger: &dyn Logger,
        flush: bool,
    ) -> Result<()> {
        if flush {
            self.to.flush().await?;
        }
        drain_stderr(&mut self.from, Some(&mut self.to), sink, source, logger, None).await
    }

    /// Ships a large request body as length-prefixed frames while a
    /// concurrent drain keeps consuming the daemon's log output; classical
    /// half-duplex would deadlock here. The two sides share one error slot:
    /// a daemon failure stops the sink, and the drain's verdict wins.
    pub(crate) async fn send_framed<N, R>(
        &mut self,
        logger: &dyn Logger,
        copier: &N,
        source: &mut R,
    ) -> Result<()>
    where
        N: NarCopy,
        R: AsyncRead + Unpin + Send,
    {
        self.to.flush().await?;
        let failure = Mutex::new(None);
        let Connection { from, to, .. } = self;
        let drain = drain_stderr(
            from,
            None::<&mut tokio::io::Sink>,
            None,
            None,
            logger,
            Some(&failure),
        );
        let send = async {
            let mut sink = FramedSink::new(to, &failure);
            copier.copy(source, &mut sink).await?;
            sink.finish().await
        };
        let (drained, sent) = tokio::join!(drain, send);
        drained?;
        sent?;
        Ok(())
    }
}

/// Reads interleaved daemon-to-client messages until the terminator.
///
/// `WRITE` appends to `sink`; `READ` answers from `source` through `to`;
/// log and activity messages go to the logger in arrival order. An `ERROR`
/// is remembered (and published to `failure`, when given, so a concurrent
/// framed sink stops early) but the loop keeps going until `LAST`, leaving
/// the wire at a message boundary before the error surfaces.
async fn drain_stderr<R, W>(
    from: &mut R,
    mut to: Option<&mut W>,
    mut sink: Option<DynSink<'_>>,
    mut source: Option<DynSource<'_>>,
    logger: &dyn Logger,
    failure: Option<&Mutex<Option<DaemonError>>>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut deferred: Option<DaemonError> = None;
    loop {
        match wire::read_stderr_tag(from).await? {
            wire::StderrTag::Write => {
                let data = wire::read_bytes(from).await.with_field("Write.data")?;
                match &mut sink {
                    Some(sink) => sink.write_all(&data).await?,
                    None => {
                        return Err(Error::Protocol(
                            "daemon sent data, but no sink was provided".into(),
                        ))
                    }
                }
            }
            wire::StderrTag::Read => {
                let len = wire::read_usize(from).await.with_field("Read.len")?;
                let Some(source) = &mut source else {
                    return Err(Error::Protocol(
                        "daemon requested data, but no source was provided".into(),
                    ));
                };
                let Some(to) = &mut to else {
                    return Err(Error::Protocol(
                        "daemon requested data on a send-only exchange".into(),
                    ));
                };
                let mut buf = vec![0u8; len];
                let n = source.read(&mut buf).await?;
                wire::write_bytes(to, &buf[..n]).await?;
                to.flush().await?;
            }
            wire::StderrTag::Error => {
                let msg = wire::read_string(from).await.with_field("Error.msg")?;
                let status = wire::read_u32(from).await.with_field("Error.status")?;
                let err = DaemonError { msg, status };
                if let Some(slot) = failure {
                    slot.lock().get_or_insert(err.clone());
                }
                deferred.get_or_insert(err);
            }
            wire::StderrTag::Next => {
                let line = wire::read_string(from).await.with_field("Next.line")?;
                logger.log(Verbosity::Error, line.trim_end());
            }
            wire::StderrTag::StartActivity => {
                let id = wire::read_u64(from).await.with_field("StartActivity.id")?;
                let level = wire::read_verbosity(from)
                    .await
                    .with_field("StartActivity.level")?;
                let kind = wire::read_u64(from)
                    .await
                    .with_field("StartActivity.kind")?
                    .try_into()
                    .with_field("StartActivity.kind")?;
                let text = wire::read_string(from)
                    .await
                    .with_field("StartActivity.text")?;
                let fields = wire::read_fields(from)
                    .await
                    .with_field("StartActivity.fields")?;
                let parent = wire::read_u64(from)
                    .await
                    .with_field("StartActivity.parent")?;
                logger.start_activity(id, level, kind, &text, &fields, parent);
            }
            wire::StderrTag::StopActivity => {
                let id = wire::read_u64(from).await.with_field("StopActivity.id")?;
                logger.stop_activity(id);
            }
            wire::StderrTag::Result => {
                let id = wire::read_u64(from).await.with_field("Result.id")?;
                let kind = wire::read_u64(from)
                    .await
                    .with_field("Result.kind")?
                    .try_into()
                    .with_field("Result.kind")?;
                let fields = wire::read_fields(from).await.with_field("Result.fields")?;
                logger.result(id, kind, &fields);
            }
            wire::StderrTag::Last => break,
        }
    }
    match deferred {
        Some(err) => Err(Error::Daemon(err)),
        None => Ok(()),
    }
}

/// Scoped checkout of one connection.
///
/// Requests signal a clean finish through [`ConnectionHandle::complete`];
/// daemon-reported errors are flagged when they pass through
/// [`ConnectionHandle::process_stderr`]. A handle dropped with neither flag
/// set presumes the wire stopped mid-frame and discards the connection.
pub(crate) struct ConnectionHandle<'a, T: AsyncRead + AsyncWrite + Send> {
    guard: PoolGuard<'a, Connection<T>>,
    logger: &'a dyn Logger,
    daemon_error: bool,
    completed: bool,
}

impl<T: AsyncRead + AsyncWrite + Send> ConnectionHandle<'_, T> {
    /// Marks the exchange as finished at a message boundary; the connection
    /// stays eligible for reuse.
    fn complete(&mut self) {
        self.completed = true;
    }

    async fn process_stderr(
        &mut self,
        sink: Option<DynSink<'_>>,
        source: Option<DynSource<'_>>,
    ) -> Result<()> {
        let logger = self.logger;
        match self.guard.process_stderr(sink, source, logger, true).await {
            Err(err @ Error::Daemon(_)) => {
                // The daemon failed the request at a well-defined frame
                // boundary; the connection itself is still in sync.
                self.daemon_error = true;
                Err(err)
            }
            other => other,
        }
    }

    async fn send_framed<N, R>(&mut self, copier: &N, source: &mut R) -> Result<()>
    where
        N: NarCopy,
        R: AsyncRead + Unpin + Send,
    {
        let logger = self.logger;
        match self.guard.send_framed(logger, copier, source).await {
            Err(err @ Error::Daemon(_)) => {
                self.daemon_error = true;
                Err(err)
            }
            other => other,
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Send> Deref for ConnectionHandle<'_, T> {
    type Target = Connection<T>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T: AsyncRead + AsyncWrite + Send> DerefMut for ConnectionHandle<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T: AsyncRead + AsyncWrite + Send> Drop for ConnectionHandle<'_, T> {
    fn drop(&mut self) {
        if !self.completed && !self.daemon_error {
            debug!("discarding daemon connection after an unexpected failure");
            self.guard.mark_bad();
        }
    }
}

/// Builds a [`DaemonClient`].
pub struct DaemonClientBuilder {
    socket_path: Option<PathBuf>,
    max_connections: usize,
    max_connection_age: Duration,
    settings: ClientSettings,
    logger: Option<Arc<dyn Logger>>,
}

impl Default for DaemonClientBuilder {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_connections: 1,
            max_connection_age: Duration::MAX,
            settings: ClientSettings::default(),
            logger: None,
        }
    }
}

impl DaemonClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Daemon socket to connect to; defaults to [`DEFAULT_SOCKET_PATH`].
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    /// Pool capacity; clamped to at least 1. Defaults to 1.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    /// Connections older than this are discarded at checkin.
    pub fn max_connection_age(mut self, age: Duration) -> Self {
        self.max_connection_age = age;
        self
    }

    /// Settings uploaded to the daemon on every new connection.
    pub fn settings(mut self, settings: ClientSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Receiver for daemon log output; defaults to [`TracingLogger`].
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Builds a client over the default Unix socket transport. No IO
    /// happens until the first request.
    pub fn build<S: Store>(self, store: S) -> DaemonClient<S, UnixConnector> {
        let connector = UnixConnector::new(self.socket_path.clone());
        self.build_with(store, connector)
    }

    /// Builds a client over a custom transport.
    pub fn build_with<S: Store, C: Connect>(self, store: S, connector: C) -> DaemonClient<S, C> {
        let logger = self.logger.unwrap_or_else(|| Arc::new(TracingLogger));
        let max_age = self.max_connection_age;
        let pool = Pool::new(
            self.max_connections,
            connector.uri(),
            move |conn: &Connection<C::Stream>| conn.start_time.elapsed() < max_age,
        );
        DaemonClient {
            store,
            logger,
            connector,
            settings: self.settings,
            pool,
        }
    }
}

/// Client for one remote daemon.
///
/// Methods map one-to-one onto protocol operations; each borrows a pooled
/// connection for the duration of the exchange. The client itself is shared
/// by reference: concurrent callers are served by distinct connections, up
/// to the configured capacity.
pub struct DaemonClient<S: Store, C: Connect = UnixConnector> {
    store: S,
    logger: Arc<dyn Logger>,
    connector: C,
    settings: ClientSettings,
    pool: Pool<Connection<C::Stream>>,
}

impl<S: Store, C: Connect> DaemonClient<S, C> {
    /// The store services this client was built with.
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn open_connection(&self) -> Result<Connection<C::Stream>> {
        let uri = self.connector.uri();
        debug!(%uri, "opening daemon connection");
        let stream = self.connector.connect().await?;
        Connection::init(stream, &self.settings, self.logger.as_ref())
            .await
            .tap_err(|err| warn!(%uri, %err, "daemon handshake failed"))
            .map_err(|err| {
                Error::Protocol(format!(
                    "cannot open connection to remote store '{}': {}",
                    uri, err
                ))
            })
    }

    async fn connection(&self) -> Result<ConnectionHandle<'_, C::Stream>> {
        let guard = self.pool.get(|| self.open_connection()).await?;
        Ok(ConnectionHandle {
            guard,
            logger: self.logger.as_ref(),
            daemon_error: false,
            completed: false,
        })
    }

    /// Forces a handshake without issuing a request.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.complete();
        Ok(())
    }

    /// The protocol version announced by the daemon.
    pub async fn daemon_version(&self) -> Result<Proto> {
        let mut conn = self.connection().await?;
        let version = conn.daemon_version;
        conn.complete();
        Ok(version)
    }

    /// Drops idle connections that no longer pass the health check.
    pub fn flush_bad_connections(&self) {
        self.pool.flush_bad();
    }

    /// Returns whether a store path is valid.
    #[instrument(skip(self))]
    pub async fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::IsValidPath)
            .await
            .with_field("IsValidPath.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("IsValidPath.path")?;
        conn.process_stderr(None, None).await?;
        let valid = wire::read_bool(&mut conn.from)
            .await
            .with_field("IsValidPath.<reply>")?;
        conn.complete();
        Ok(valid)
    }

    /// Returns which of the given paths are valid. The substitute flag is
    /// accepted for interface parity, but has no wire representation in our
    /// protocol range.
    #[instrument(skip(self))]
    pub async fn query_valid_paths(
        &self,
        paths: &BTreeSet<StorePath>,
        _maybe_substitute: bool,
    ) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.connection().await?;
        if !conn.daemon_version.since(12) {
            // Old daemons can only be asked one path at a time.
            let mut valid = BTreeSet::new();
            for path in paths {
                wire::write_op(&mut conn.to, wire::Op::IsValidPath)
                    .await
                    .with_field("IsValidPath.<op>")?;
                wire::write_store_path(&self.store, &mut conn.to, path)
                    .await
                    .with_field("IsValidPath.path")?;
                conn.process_stderr(None, None).await?;
                if wire::read_bool(&mut conn.from)
                    .await
                    .with_field("IsValidPath.<reply>")?
                {
                    valid.insert(path.clone());
                }
            }
            conn.complete();
            return Ok(valid);
        }
        wire::write_op(&mut conn.to, wire::Op::QueryValidPaths)
            .await
            .with_field("QueryValidPaths.<op>")?;
        wire::write_store_paths(&self.store, &mut conn.to, paths)
            .await
            .with_field("QueryValidPaths.paths")?;
        conn.process_stderr(None, None).await?;
        let valid = wire::read_store_paths(&self.store, &mut conn.from)
            .await
            .with_field("QueryValidPaths.<reply>")?;
        conn.complete();
        Ok(valid)
    }

    /// Returns every valid path in the store.
    #[instrument(skip(self))]
    pub async fn query_all_valid_paths(&self) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::QueryAllValidPaths)
            .await
            .with_field("QueryAllValidPaths.<op>")?;
        conn.process_stderr(None, None).await?;
        let paths = wire::read_store_paths(&self.store, &mut conn.from)
            .await
            .with_field("QueryAllValidPaths.<reply>")?;
        conn.complete();
        Ok(paths)
    }

    /// Returns which of the given paths a substituter could provide.
    #[instrument(skip(self))]
    pub async fn query_substitutable_paths(
        &self,
        paths: &BTreeSet<StorePath>,
    ) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.connection().await?;
        if !conn.daemon_version.since(12) {
            let mut substitutable = BTreeSet::new();
            for path in paths {
                wire::write_op(&mut conn.to, wire::Op::HasSubstitutes)
                    .await
                    .with_field("HasSubstitutes.<op>")?;
                wire::write_store_path(&self.store, &mut conn.to, path)
                    .await
                    .with_field("HasSubstitutes.path")?;
                conn.process_stderr(None, None).await?;
                if wire::read_bool(&mut conn.from)
                    .await
                    .with_field("HasSubstitutes.<reply>")?
                {
                    substitutable.insert(path.clone());
                }
            }
            conn.complete();
            return Ok(substitutable);
        }
        wire::write_op(&mut conn.to, wire::Op::QuerySubstitutablePaths)
            .await
            .with_field("QuerySubstitutablePaths.<op>")?;
        wire::write_store_paths(&self.store, &mut conn.to, paths)
            .await
            .with_field("QuerySubstitutablePaths.paths")?;
        conn.process_stderr(None, None).await?;
        let substitutable = wire::read_store_paths(&self.store, &mut conn.from)
            .await
            .with_field("QuerySubstitutablePaths.<reply>")?;
        conn.complete();
        Ok(substitutable)
    }

    /// Returns substituter metadata for the given paths; paths without a
    /// substitute are left out.
    #[instrument(skip(self))]
    pub async fn query_substitutable_path_infos(
        &self,
        paths: &BTreeMap<StorePath, Option<ContentAddress>>,
    ) -> Result<BTreeMap<StorePath, SubstitutablePathInfo>> {
        let mut infos = BTreeMap::new();
        if paths.is_empty() {
            return Ok(infos);
        }
        let mut conn = self.connection().await?;
        let proto = conn.daemon_version;
        if !proto.since(12) {
            for path in paths.keys() {
                wire::write_op(&mut conn.to, wire::Op::QuerySubstitutablePathInfo)
                    .await
                    .with_field("QuerySubstitutablePathInfo.<op>")?;
                wire::write_store_path(&self.store, &mut conn.to, path)
                    .await
                    .with_field("QuerySubstitutablePathInfo.path")?;
                conn.process_stderr(None, None).await?;
                if !wire::read_bool(&mut conn.from)
                    .await
                    .with_field("QuerySubstitutablePathInfo.found")?
                {
                    continue;
                }
                let info = Self::read_substitutable_info(&self.store, &mut conn.from).await?;
                infos.insert(path.clone(), info);
            }
            conn.complete();
            return Ok(infos);
        }

        wire::write_op(&mut conn.to, wire::Op::QuerySubstitutablePathInfos)
            .await
            .with_field("QuerySubstitutablePathInfos.<op>")?;
        if !proto.since(22) {
            let bare: BTreeSet<StorePath> = paths.keys().cloned().collect();
            wire::write_store_paths(&self.store, &mut conn.to, &bare)
                .await
                .with_field("QuerySubstitutablePathInfos.paths")?;
        } else {
            wire::write_store_path_ca_map(&self.store, &mut conn.to, paths)
                .await
                .with_field("QuerySubstitutablePathInfos.paths")?;
        }
        conn.process_stderr(None, None).await?;
        let count = wire::read_usize(&mut conn.from)
            .await
            .with_field("QuerySubstitutablePathInfos.<count>")?;
        for _ in 0..count {
            let path = wire::read_store_path(&self.store, &mut conn.from)
                .await
                .with_field("QuerySubstitutablePathInfos.path")?;
            let info = Self::read_substitutable_info(&self.store, &mut conn.from).await?;
            infos.insert(path, info);
        }
        conn.complete();
        Ok(infos)
    }

    async fn read_substitutable_info<R: AsyncRead + Unpin + Send>(
        store: &S,
        from: &mut R,
    ) -> Result<SubstitutablePathInfo> {
        let deriver = wire::read_opt_store_path(store, from)
            .await
            .with_field("SubstitutablePathInfo.deriver")?;
        let references = wire::read_store_paths(store, from)
            .await
            .with_field("SubstitutablePathInfo.references")?;
        let download_size = wire::read_u64(from)
            .await
            .with_field("SubstitutablePathInfo.download_size")?;
        let nar_size = wire::read_u64(from)
            .await
            .with_field("SubstitutablePathInfo.nar_size")?;
        Ok(SubstitutablePathInfo {
            deriver,
            references,
            download_size,
            nar_size,
        })
    }

    /// Returns metadata for one valid path, or [`Error::InvalidPath`].
    #[instrument(skip(self))]
    pub async fn query_path_info(&self, path: &StorePath) -> Result<ValidPathInfo> {
        let mut conn = self.connection().await?;
        let proto = conn.daemon_version;
        wire::write_op(&mut conn.to, wire::Op::QueryPathInfo)
            .await
            .with_field("QueryPathInfo.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("QueryPathInfo.path")?;
        match conn.process_stderr(None, None).await {
            // Daemons predating the validity flag report this as a plain
            // error; recognize them by message, as deployed clients do.
            Err(Error::Daemon(err)) if err.msg.contains("is not valid") => {
                return Err(Error::InvalidPath(self.store.print_store_path(path)));
            }
            other => other?,
        }
        if proto.since(17)
            && !wire::read_bool(&mut conn.from)
                .await
                .with_field("QueryPathInfo.valid")?
        {
            conn.complete();
            return Err(Error::InvalidPath(self.store.print_store_path(path)));
        }
        let info = wire::read_valid_path_info(&self.store, &mut conn.from, proto, path.clone())
            .await
            .with_field("QueryPathInfo.<reply>")?;
        conn.complete();
        Ok(info)
    }

    /// Returns the paths that reference the given path.
    #[instrument(skip(self))]
    pub async fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::QueryReferrers)
            .await
            .with_field("QueryReferrers.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("QueryReferrers.path")?;
        conn.process_stderr(None, None).await?;
        let referrers = wire::read_store_paths(&self.store, &mut conn.from)
            .await
            .with_field("QueryReferrers.<reply>")?;
        conn.complete();
        Ok(referrers)
    }

    /// Returns the derivations present in the store that produce this path.
    #[instrument(skip(self))]
    pub async fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::QueryValidDerivers)
            .await
            .with_field("QueryValidDerivers.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("QueryValidDerivers.path")?;
        conn.process_stderr(None, None).await?;
        let derivers = wire::read_store_paths(&self.store, &mut conn.from)
            .await
            .with_field("QueryValidDerivers.<reply>")?;
        conn.complete();
        Ok(derivers)
    }

    /// Returns the output paths of a derivation.
    #[instrument(skip(self))]
    pub async fn query_derivation_outputs(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let mut conn = self.connection().await?;
        if conn.daemon_version.since(0x16) {
            // Newer daemons dropped the dedicated opcode; collect the known
            // entries of the output map instead.
            conn.complete();
            drop(conn);
            let map = self.query_partial_derivation_output_map(path).await?;
            return Ok(map.into_values().flatten().collect());
        }
        wire::write_op(&mut conn.to, wire::Op::QueryDerivationOutputs)
            .await
            .with_field("QueryDerivationOutputs.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("QueryDerivationOutputs.path")?;
        conn.process_stderr(None, None).await?;
        let outputs = wire::read_store_paths(&self.store, &mut conn.from)
            .await
            .with_field("QueryDerivationOutputs.<reply>")?;
        conn.complete();
        Ok(outputs)
    }

    /// Returns a derivation's outputs along with their paths, where known.
    #[instrument(skip(self))]
    pub async fn query_partial_derivation_output_map(
        &self,
        path: &StorePath,
    ) -> Result<BTreeMap<String, Option<StorePath>>> {
        {
            let mut conn = self.connection().await?;
            if conn.daemon_version.since(0x16) {
                wire::write_op(&mut conn.to, wire::Op::QueryDerivationOutputMap)
                    .await
                    .with_field("QueryDerivationOutputMap.<op>")?;
                wire::write_store_path(&self.store, &mut conn.to, path)
                    .await
                    .with_field("QueryDerivationOutputMap.path")?;
                conn.process_stderr(None, None).await?;
                let map = wire::read_output_map(&self.store, &mut conn.from)
                    .await
                    .with_field("QueryDerivationOutputMap.<reply>")?;
                conn.complete();
                return Ok(map);
            }
            conn.complete();
        }
        // Old daemons cannot answer this; infer what the derivation itself
        // knows. The handle is released first so the store layer may issue
        // its own requests.
        self.store.derivation_output_map(path).await
    }

    /// Looks up a store path by the hash part of its base name.
    #[instrument(skip(self))]
    pub async fn query_path_from_hash_part(&self, hash_part: &str) -> Result<Option<StorePath>> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::QueryPathFromHashPart)
            .await
            .with_field("QueryPathFromHashPart.<op>")?;
        wire::write_string(&mut conn.to, hash_part)
            .await
            .with_field("QueryPathFromHashPart.hash_part")?;
        conn.process_stderr(None, None).await?;
        let path = wire::read_opt_store_path(&self.store, &mut conn.from)
            .await
            .with_field("QueryPathFromHashPart.<reply>")?;
        conn.complete();
        Ok(path)
    }

    /// Adds content to the store, named by the given content-address
    /// method, and returns the metadata of the resulting path.
    #[instrument(skip(self, dump))]
    pub async fn add_ca_to_store<R>(
        &self,
        dump: &mut R,
        name: &str,
        method: CaMethod,
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<ValidPathInfo>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut conn = self.connection().await?;
        let proto = conn.daemon_version;

        if proto.since(25) {
            wire::write_op(&mut conn.to, wire::Op::AddToStore)
                .await
                .with_field("AddToStore.<op>")?;
            wire::write_string(&mut conn.to, name)
                .await
                .with_field("AddToStore.name")?;
            wire::write_string(&mut conn.to, method.render())
                .await
                .with_field("AddToStore.camStr")?;
            wire::write_store_paths(&self.store, &mut conn.to, references)
                .await
                .with_field("AddToStore.refs")?;
            wire::write_bool(&mut conn.to, repair)
                .await
                .with_field("AddToStore.repair")?;
            conn.send_framed(&Passthrough, dump).await?;
            let path = wire::read_store_path(&self.store, &mut conn.from)
                .await
                .with_field("AddToStore.path")?;
            let info = wire::read_valid_path_info(&self.store, &mut conn.from, proto, path)
                .await
                .with_field("AddToStore.<reply>")?;
            conn.complete();
            return Ok(info);
        }

        if repair {
            conn.complete();
            return Err(Error::Protocol(
                "repairing is not supported when building through a daemon older than protocol 1.25"
                    .into(),
            ));
        }

        match method {
            CaMethod::Text => {
                let mut contents = Vec::new();
                dump.read_to_end(&mut contents).await?;
                wire::write_op(&mut conn.to, wire::Op::AddTextToStore)
                    .await
                    .with_field("AddTextToStore.<op>")?;
                wire::write_string(&mut conn.to, name)
                    .await
                    .with_field("AddTextToStore.name")?;
                wire::write_bytes(&mut conn.to, &contents)
                    .await
                    .with_field("AddTextToStore.contents")?;
                wire::write_store_paths(&self.store, &mut conn.to, references)
                    .await
                    .with_field("AddTextToStore.refs")?;
                conn.process_stderr(None, None).await?;
            }
            CaMethod::Flat(algo) | CaMethod::Recursive(algo) => {
                let recursive = matches!(method, CaMethod::Recursive(_));
                wire::write_op(&mut conn.to, wire::Op::AddToStore)
                    .await
                    .with_field("AddToStore.<op>")?;
                wire::write_string(&mut conn.to, name)
                    .await
                    .with_field("AddToStore.name")?;
                // Compatibility flag older daemons use in place of the hash
                // name for the sha256/recursive case.
                wire::write_u64(
                    &mut conn.to,
                    if algo == crate::HashAlgo::Sha256 && recursive {
                        0
                    } else {
                        1
                    },
                )
                .await
                .with_field("AddToStore.fixed")?;
                wire::write_bool(&mut conn.to, recursive)
                    .await
                    .with_field("AddToStore.recursive")?;
                wire::write_string(&mut conn.to, algo.name())
                    .await
                    .with_field("AddToStore.hash_algo")?;

                // The upload can take a while; give the slot back to other
                // callers for its duration.
                self.pool.inc_capacity();
                let streamed: std::io::Result<()> = if recursive {
                    tokio::io::copy(dump, &mut conn.to).await.map(|_| ())
                } else {
                    let mut contents = Vec::new();
                    match dump.read_to_end(&mut contents).await {
                        Ok(_) => wire::write_bytes(&mut conn.to, &contents).await,
                        Err(err) => Err(err),
                    }
                };
                self.pool.dec_capacity().await;

                if let Err(err) = streamed {
                    if err.kind() == std::io::ErrorKind::BrokenPipe {
                        // The daemon hung up mid-upload, probably with a
                        // reason on the stderr stream; surface that instead
                        // if it is there.
                        match conn.process_stderr(None, None).await {
                            Ok(()) => {}
                            Err(Error::Io(ref io))
                                if io.kind() == std::io::ErrorKind::UnexpectedEof => {}
                            Err(other) => return Err(other),
                        }
                    }
                    return Err(err.into());
                }
                conn.process_stderr(None, None).await?;
            }
        }

        let path = wire::read_store_path(&self.store, &mut conn.from)
            .await
            .with_field("AddToStore.path")?;
        conn.complete();
        // Release the connection before querying, or a pool of one would
        // deadlock against ourselves.
        drop(conn);
        self.query_path_info(&path).await
    }

    /// Adds content through [`DaemonClient::add_ca_to_store`] with no
    /// references, returning just the path.
    #[instrument(skip(self, dump))]
    pub async fn add_to_store_from_dump<R>(
        &self,
        dump: &mut R,
        name: &str,
        method: CaMethod,
        repair: bool,
    ) -> Result<StorePath>
    where
        R: AsyncRead + Unpin + Send,
    {
        let info = self
            .add_ca_to_store(dump, name, method, &BTreeSet::new(), repair)
            .await?;
        Ok(info.path)
    }

    /// Adds a text file to the store.
    #[instrument(skip(self, contents))]
    pub async fn add_text_to_store(
        &self,
        name: &str,
        contents: &str,
        references: &BTreeSet<StorePath>,
        repair: bool,
    ) -> Result<StorePath> {
        let mut source = std::io::Cursor::new(contents.as_bytes());
        let info = self
            .add_ca_to_store(&mut source, name, CaMethod::Text, references, repair)
            .await?;
        Ok(info.path)
    }

    /// Imports a path with known metadata, streaming its NAR serialization.
    #[instrument(skip(self, source, copier))]
    pub async fn add_to_store<R, N>(
        &self,
        info: &ValidPathInfo,
        source: &mut R,
        copier: &N,
        repair: bool,
        check_sigs: bool,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        N: NarCopy,
    {
        let mut conn = self.connection().await?;
        let proto = conn.daemon_version;

        if !proto.since(18) {
            // Ancient daemons only know the export format, and pull it from
            // us through stderr read requests.
            wire::write_op(&mut conn.to, wire::Op::ImportPaths)
                .await
                .with_field("ImportPaths.<op>")?;
            let mut body: Vec<u8> = Vec::new();
            wire::write_u64(&mut body, 1).await?; // a path follows
            copier.copy(source, &mut body).await?;
            wire::write_u64(&mut body, wire::EXPORT_MAGIC).await?;
            wire::write_string(&mut body, self.store.print_store_path(&info.path)).await?;
            wire::write_store_paths(&self.store, &mut body, &info.references).await?;
            wire::write_opt_store_path(&self.store, &mut body, info.deriver.as_ref()).await?;
            wire::write_u64(&mut body, 0).await?; // no legacy signature
            wire::write_u64(&mut body, 0).await?; // end of path list
            let mut body = std::io::Cursor::new(body);
            conn.process_stderr(None, Some(&mut body)).await?;
            let _imported = wire::read_store_paths(&self.store, &mut conn.from)
                .await
                .with_field("ImportPaths.<reply>")?;
            conn.complete();
            return Ok(());
        }

        wire::write_op(&mut conn.to, wire::Op::AddToStoreNar)
            .await
            .with_field("AddToStoreNar.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, &info.path)
            .await
            .with_field("AddToStoreNar.path")?;
        wire::write_opt_store_path(&self.store, &mut conn.to, info.deriver.as_ref())
            .await
            .with_field("AddToStoreNar.deriver")?;
        wire::write_string(&mut conn.to, &info.nar_hash)
            .await
            .with_field("AddToStoreNar.nar_hash")?;
        wire::write_store_paths(&self.store, &mut conn.to, &info.references)
            .await
            .with_field("AddToStoreNar.references")?;
        wire::write_datetime(&mut conn.to, info.registration_time)
            .await
            .with_field("AddToStoreNar.registration_time")?;
        wire::write_u64(&mut conn.to, info.nar_size)
            .await
            .with_field("AddToStoreNar.nar_size")?;
        wire::write_bool(&mut conn.to, info.ultimate)
            .await
            .with_field("AddToStoreNar.ultimate")?;
        wire::write_strings(&mut conn.to, &info.sigs)
            .await
            .with_field("AddToStoreNar.sigs")?;
        wire::write_opt_content_address(&self.store, &mut conn.to, info.ca.as_ref())
            .await
            .with_field("AddToStoreNar.ca")?;
        wire::write_bool(&mut conn.to, repair)
            .await
            .with_field("AddToStoreNar.repair")?;
        wire::write_bool(&mut conn.to, !check_sigs)
            .await
            .with_field("AddToStoreNar.dont_check_sigs")?;

        if proto.since(23) {
            conn.send_framed(copier, source).await?;
        } else if proto.since(21) {
            conn.process_stderr(None, Some(source)).await?;
        } else {
            copier.copy(source, &mut conn.to).await?;
            conn.process_stderr(None, None).await?;
        }
        conn.complete();
        Ok(())
    }

    /// Builds the given targets.
    #[instrument(skip(self))]
    pub async fn build_paths(&self, targets: &[PathWithOutputs], mode: BuildMode) -> Result<()> {
        let mut conn = self.connection().await?;
        let proto = conn.daemon_version;
        if !proto.since(13) {
            conn.complete();
            return Err(Error::Protocol(format!(
                "daemon protocol {} cannot build paths",
                proto
            )));
        }
        wire::write_op(&mut conn.to, wire::Op::BuildPaths)
            .await
            .with_field("BuildPaths.<op>")?;
        let rendered: Vec<String> = targets.iter().map(|t| t.render(&self.store)).collect();
        wire::write_strings(&mut conn.to, &rendered)
            .await
            .with_field("BuildPaths.paths")?;
        if proto.since(15) {
            wire::write_u64(&mut conn.to, mode.into())
                .await
                .with_field("BuildPaths.mode")?;
        } else if mode != BuildMode::Normal {
            // Old daemons take no build mode; anything but a normal build
            // cannot be expressed.
            return Err(Error::Protocol(
                "repairing or checking is not supported by this daemon".into(),
            ));
        }
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("BuildPaths.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Builds a single derivation. `drv_wire` is the derivation body as
    /// serialized by the store layer's derivation writer.
    #[instrument(skip(self, drv_wire))]
    pub async fn build_derivation(
        &self,
        drv_path: &StorePath,
        drv_wire: &[u8],
        mode: BuildMode,
    ) -> Result<BuildResult> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::BuildDerivation)
            .await
            .with_field("BuildDerivation.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, drv_path)
            .await
            .with_field("BuildDerivation.path")?;
        conn.to
            .write_all(drv_wire)
            .await
            .with_field("BuildDerivation.drv")?;
        wire::write_u64(&mut conn.to, mode.into())
            .await
            .with_field("BuildDerivation.mode")?;
        conn.process_stderr(None, None).await?;
        let status = wire::read_u64(&mut conn.from)
            .await
            .map_err(Error::from)
            .and_then(|v| Ok(v.try_into()?))
            .with_field("BuildDerivation.status")?;
        let error_msg = wire::read_string(&mut conn.from)
            .await
            .with_field("BuildDerivation.error_msg")?;
        conn.complete();
        Ok(BuildResult { status, error_msg })
    }

    /// Makes sure a path is present, substituting or building as needed.
    #[instrument(skip(self))]
    pub async fn ensure_path(&self, path: &StorePath) -> Result<()> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::EnsurePath)
            .await
            .with_field("EnsurePath.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("EnsurePath.path")?;
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("EnsurePath.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Creates a temporary GC root that lives until this client goes away.
    #[instrument(skip(self))]
    pub async fn add_temp_root(&self, path: &StorePath) -> Result<()> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::AddTempRoot)
            .await
            .with_field("AddTempRoot.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("AddTempRoot.path")?;
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("AddTempRoot.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Registers a persistent, indirect GC root; `path` is a symlink
    /// outside the store.
    #[instrument(skip(self))]
    pub async fn add_indirect_root(&self, path: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::AddIndirectRoot)
            .await
            .with_field("AddIndirectRoot.<op>")?;
        wire::write_string(&mut conn.to, path)
            .await
            .with_field("AddIndirectRoot.path")?;
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("AddIndirectRoot.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Blocks until a concurrent garbage collection is done registering our
    /// temporary roots.
    #[instrument(skip(self))]
    pub async fn sync_with_gc(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::SyncWithGC)
            .await
            .with_field("SyncWithGC.<op>")?;
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("SyncWithGC.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Returns all GC roots as a map from target to the links naming it.
    #[instrument(skip(self))]
    pub async fn find_roots(
        &self,
        _censor: bool,
    ) -> Result<BTreeMap<StorePath, BTreeSet<String>>> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::FindRoots)
            .await
            .with_field("FindRoots.<op>")?;
        conn.process_stderr(None, None).await?;
        let count = wire::read_usize(&mut conn.from)
            .await
            .with_field("FindRoots.<count>")?;
        let mut roots: BTreeMap<StorePath, BTreeSet<String>> = BTreeMap::new();
        for _ in 0..count {
            let link = wire::read_string(&mut conn.from)
                .await
                .with_field("FindRoots.roots[].link")?;
            let target = wire::read_store_path(&self.store, &mut conn.from)
                .await
                .with_field("FindRoots.roots[].target")?;
            roots.entry(target).or_default().insert(link);
        }
        conn.complete();
        Ok(roots)
    }

    /// Runs garbage collection and invalidates the store layer's path-info
    /// cache, since the live set has changed.
    #[instrument(skip(self))]
    pub async fn collect_garbage(&self, options: &GcOptions) -> Result<GcResults> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::CollectGarbage)
            .await
            .with_field("CollectGarbage.<op>")?;
        wire::write_u64(&mut conn.to, options.action.into())
            .await
            .with_field("CollectGarbage.action")?;
        wire::write_store_paths(&self.store, &mut conn.to, &options.paths_to_delete)
            .await
            .with_field("CollectGarbage.paths_to_delete")?;
        wire::write_bool(&mut conn.to, options.ignore_liveness)
            .await
            .with_field("CollectGarbage.ignore_liveness")?;
        wire::write_u64(&mut conn.to, options.max_freed)
            .await
            .with_field("CollectGarbage.max_freed")?;
        // Removed options, still on the wire.
        for _ in 0..3 {
            wire::write_u64(&mut conn.to, 0)
                .await
                .with_field("CollectGarbage.obsolete")?;
        }
        conn.process_stderr(None, None).await?;
        let paths = {
            use tokio_stream::StreamExt;
            wire::read_strings(&mut conn.from)
                .collect::<Result<Vec<_>>>()
                .await
                .with_field("CollectGarbage.paths")?
                .into_iter()
                .collect()
        };
        let bytes_freed = wire::read_u64(&mut conn.from)
            .await
            .with_field("CollectGarbage.bytes_freed")?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("CollectGarbage.obsolete")?;
        conn.complete();
        self.store.clear_path_info_cache();
        Ok(GcResults { paths, bytes_freed })
    }

    /// Deduplicates identical store files.
    #[instrument(skip(self))]
    pub async fn optimise_store(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::OptimiseStore)
            .await
            .with_field("OptimiseStore.<op>")?;
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("OptimiseStore.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Checks store consistency; returns whether errors remain.
    #[instrument(skip(self))]
    pub async fn verify_store(&self, check_contents: bool, repair: bool) -> Result<bool> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::VerifyStore)
            .await
            .with_field("VerifyStore.<op>")?;
        wire::write_bool(&mut conn.to, check_contents)
            .await
            .with_field("VerifyStore.check_contents")?;
        wire::write_bool(&mut conn.to, repair)
            .await
            .with_field("VerifyStore.repair")?;
        conn.process_stderr(None, None).await?;
        let errors = wire::read_bool(&mut conn.from)
            .await
            .with_field("VerifyStore.<reply>")?;
        conn.complete();
        Ok(errors)
    }

    /// Attaches signatures to a path.
    #[instrument(skip(self))]
    pub async fn add_signatures(&self, path: &StorePath, sigs: &BTreeSet<String>) -> Result<()> {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::AddSignatures)
            .await
            .with_field("AddSignatures.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("AddSignatures.path")?;
        wire::write_strings(&mut conn.to, sigs)
            .await
            .with_field("AddSignatures.sigs")?;
        conn.process_stderr(None, None).await?;
        wire::read_u64(&mut conn.from)
            .await
            .with_field("AddSignatures.<reply>")?;
        conn.complete();
        Ok(())
    }

    /// Estimates what realizing the targets would build, substitute or
    /// leave unknown.
    #[instrument(skip(self))]
    pub async fn query_missing(&self, targets: &[PathWithOutputs]) -> Result<Missing> {
        {
            let mut conn = self.connection().await?;
            let proto = conn.daemon_version;
            if proto.since(19) {
                wire::write_op(&mut conn.to, wire::Op::QueryMissing)
                    .await
                    .with_field("QueryMissing.<op>")?;
                let rendered: Vec<String> =
                    targets.iter().map(|t| t.render(&self.store)).collect();
                wire::write_strings(&mut conn.to, &rendered)
                    .await
                    .with_field("QueryMissing.targets")?;
                conn.process_stderr(None, None).await?;
                let will_build = wire::read_store_paths(&self.store, &mut conn.from)
                    .await
                    .with_field("QueryMissing.will_build")?;
                let will_substitute = wire::read_store_paths(&self.store, &mut conn.from)
                    .await
                    .with_field("QueryMissing.will_substitute")?;
                let unknown = wire::read_store_paths(&self.store, &mut conn.from)
                    .await
                    .with_field("QueryMissing.unknown")?;
                let download_size = wire::read_u64(&mut conn.from)
                    .await
                    .with_field("QueryMissing.download_size")?;
                let nar_size = wire::read_u64(&mut conn.from)
                    .await
                    .with_field("QueryMissing.nar_size")?;
                conn.complete();
                return Ok(Missing {
                    will_build,
                    will_substitute,
                    unknown,
                    download_size,
                    nar_size,
                });
            }
            conn.complete();
            // Fall through with the handle released; the store layer's own
            // inference will call right back into us.
        }
        self.store.query_missing(targets).await
    }

    /// Streams a path's NAR serialization into `sink`.
    #[instrument(skip(self, sink, copier))]
    pub async fn nar_from_path<W, N>(
        &self,
        path: &StorePath,
        sink: &mut W,
        copier: &N,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
        N: NarCopy,
    {
        let mut conn = self.connection().await?;
        wire::write_op(&mut conn.to, wire::Op::NarFromPath)
            .await
            .with_field("NarFromPath.<op>")?;
        wire::write_store_path(&self.store, &mut conn.to, path)
            .await
            .with_field("NarFromPath.path")?;
        conn.process_stderr(None, None).await?;
        copier.copy(&mut conn.from, sink).await?;
        conn.complete();
        Ok(())
    }
}
