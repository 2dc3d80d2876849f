// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! nix-remote-store
//! ================
//!
//! This library talks to a [Nix](https://nixos.org/) build daemon over its
//! framed binary worker protocol, through a bounded pool of reusable
//! connections.
//!
//! - [`daemon::DaemonClient`] is the entry point; construct one through
//!   [`daemon::DaemonClientBuilder`] and call its per-operation methods.
//! - Store-path parsing, content addressing, NAR serialization and logging
//!   are *not* implemented here; the client borrows them through the
//!   [`Store`], [`NarCopy`] and [`Logger`] traits.
//!
//! The protocol negotiates the highest version both ends understand at
//! connection time. This client speaks 1.25 and accepts daemons down to
//! minor 10, reproducing the per-version request variants older daemons
//! require.

pub mod daemon;

use chrono::{DateTime, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub type Result<T, E = Error> = std::result::Result<T, E>;

trait ResultExt<T, E> {
    fn with_field(self, f: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T, E> for Result<T, E> {
    fn with_field(self, f: &'static str) -> Result<T> {
        self.map_err(|err| Error::Field(f, Box::new(err.into())))
    }
}

/// Error enum for the library.
#[derive(Debug, Error)]
pub enum Error {
    /// This error was encountered while reading/writing a specific field.
    #[error("`{0}`: {1}")]
    Field(&'static str, #[source] Box<Error>),

    /// A frame was decoded, but its contents break the protocol: an unknown
    /// message tag, a magic/version mismatch, an integer that does not fit
    /// its target type, or a read-back request with nothing to serve it.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-framed error reported by the daemon. The wire stays at a
    /// message boundary, so the connection remains usable.
    #[error("{0}")]
    Daemon(DaemonError),

    /// The daemon does not consider this path part of its store.
    #[error("path '{0}' is not valid")]
    InvalidPath(String),

    /// A previous handshake failure permanently poisoned the client; no new
    /// connections will be attempted.
    #[error("opening a connection to remote store '{0}' previously failed")]
    PoolFailed(String),

    /// IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An error sent by the daemon over the stderr side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonError {
    pub msg: String,
    pub status: u32,
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

/// An absolute path into the content-addressed store, transported verbatim.
///
/// Validation policy belongs to the [`Store`] implementation; the client
/// never inspects the text beyond emptiness checks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rendered content address, eg. `text:sha256:1b4sb...` or
/// `fixed:r:sha256:1gd7a...`. Structure and verification live in the store
/// layer; the client ships the textual form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentAddress(String);

impl ContentAddress {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash algorithm named in a content-address method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

/// How [`daemon::DaemonClient::add_ca_to_store`] should ingest its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaMethod {
    /// Plain text, hashed with SHA-256.
    Text,
    /// A single file, hashed flat.
    Flat(HashAlgo),
    /// An archive dump of a file tree, hashed recursively.
    Recursive(HashAlgo),
}

impl CaMethod {
    /// Renders the method the way newer daemons expect it in `AddToStore`.
    pub fn render(&self) -> String {
        match self {
            Self::Text => "text:sha256".into(),
            Self::Flat(algo) => format!("fixed:{}", algo.name()),
            Self::Recursive(algo) => format!("fixed:r:{}", algo.name()),
        }
    }
}

/// Verbosity of a log line or activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Verbosity {
    Error = 0,
    Warn,
    Notice,
    Info,
    Talkative,
    Chatty,
    Debug,
    Vomit,
}
impl From<TryFromPrimitiveError<Verbosity>> for Error {
    fn from(value: TryFromPrimitiveError<Verbosity>) -> Self {
        Self::Protocol(format!("Verbosity({:x})", value.number))
    }
}

/// Type of an activity reported over the stderr side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ActivityType {
    Unknown = 0,
    CopyPath = 100,
    FileTransfer = 101,
    Realise = 102,
    CopyPaths = 103,
    Builds = 104,
    Build = 105,
    OptimiseStore = 106,
    VerifyPaths = 107,
    Substitute = 108,
    QueryPathInfo = 109,
    PostBuildHook = 110,
    BuildWaiting = 111,
}
impl From<TryFromPrimitiveError<ActivityType>> for Error {
    fn from(value: TryFromPrimitiveError<ActivityType>) -> Self {
        Self::Protocol(format!("ActivityType({:x})", value.number))
    }
}

/// Type of an activity progress result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ResultType {
    FileLinked = 100,
    BuildLogLine = 101,
    UntrustedPath = 102,
    CorruptedPath = 103,
    SetPhase = 104,
    Progress = 105,
    SetExpected = 106,
    PostBuildLogLine = 107,
}
impl From<TryFromPrimitiveError<ResultType>> for Error {
    fn from(value: TryFromPrimitiveError<ResultType>) -> Self {
        Self::Protocol(format!("ResultType({:x})", value.number))
    }
}

/// A raw field attached to an activity or result event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerField {
    Int(u64),
    String(String),
}

impl LoggerField {
    /// If this is a Self::Int, return the value, else None.
    pub fn as_int(&self) -> Option<u64> {
        if let Self::Int(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    /// If this is a Self::String, return the value, else None.
    pub fn as_string(&self) -> Option<&str> {
        if let Self::String(v) = self {
            Some(v)
        } else {
            None
        }
    }
}

/// Sink for log lines and structured activity events the daemon interleaves
/// with replies.
///
/// Events are delivered in the order the daemon produced them on each
/// connection. Implementations must be thread-safe; concurrent requests on
/// distinct connections report through the same logger.
pub trait Logger: Send + Sync {
    /// A plain line of daemon output.
    fn log(&self, level: Verbosity, msg: &str);
    /// An activity (such as a build) has started.
    fn start_activity(
        &self,
        id: u64,
        level: Verbosity,
        kind: ActivityType,
        text: &str,
        fields: &[LoggerField],
        parent: u64,
    );
    /// An activity has finished.
    fn stop_activity(&self, id: u64);
    /// A progress update from a running activity.
    fn result(&self, id: u64, kind: ResultType, fields: &[LoggerField]);
}

/// [`Logger`] that forwards everything to [`tracing`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Verbosity, msg: &str) {
        match level {
            Verbosity::Error => tracing::error!("{}", msg),
            Verbosity::Warn => tracing::warn!("{}", msg),
            Verbosity::Notice | Verbosity::Info => tracing::info!("{}", msg),
            Verbosity::Talkative | Verbosity::Chatty => tracing::debug!("{}", msg),
            Verbosity::Debug | Verbosity::Vomit => tracing::trace!("{}", msg),
        }
    }

    fn start_activity(
        &self,
        id: u64,
        level: Verbosity,
        kind: ActivityType,
        text: &str,
        fields: &[LoggerField],
        parent: u64,
    ) {
        tracing::debug!(id, ?level, ?kind, text, ?fields, parent, "activity started");
    }

    fn stop_activity(&self, id: u64) {
        tracing::debug!(id, "activity stopped");
    }

    fn result(&self, id: u64, kind: ResultType, fields: &[LoggerField]) {
        tracing::trace!(id, ?kind, ?fields, "activity result");
    }
}

/// Store-side services the protocol client delegates to.
///
/// The wire transports store paths and content addresses in textual form;
/// how they are validated and resolved is the surrounding store layer's
/// business. Sufficiently old daemons additionally push work back onto the
/// client, surfaced here as [`Store::derivation_output_map`] and
/// [`Store::query_missing`].
pub trait Store: Send + Sync {
    /// Parses a textual store path received from the daemon.
    fn parse_store_path(&self, s: &str) -> Result<StorePath>;
    /// Renders a store path for the wire.
    fn print_store_path(&self, path: &StorePath) -> String;
    /// Parses a rendered content address.
    fn parse_content_address(&self, s: &str) -> Result<ContentAddress>;
    /// Renders a content address for the wire.
    fn render_content_address(&self, ca: &ContentAddress) -> String;

    /// Infers a derivation's output map from the derivation itself, for
    /// daemons that cannot answer `QueryDerivationOutputMap`. This misses
    /// outputs only known because they have been built, which daemons that
    /// old cannot track anyway.
    fn derivation_output_map(
        &self,
        path: &StorePath,
    ) -> impl Future<Output = Result<BTreeMap<String, Option<StorePath>>>> + Send;

    /// Estimates what would be built or substituted, for daemons that
    /// cannot answer `QueryMissing`.
    fn query_missing(
        &self,
        targets: &[PathWithOutputs],
    ) -> impl Future<Output = Result<Missing>> + Send;

    /// Drops any cached path metadata. Called after garbage collection, when
    /// the live set has changed under the cache.
    fn clear_path_info_cache(&self) {}
}

/// Copies exactly one NAR archive between two byte streams.
///
/// The archive format is opaque to the protocol client, but several
/// operations ship or receive NARs on an otherwise undelimited stream, so
/// the copier must recognize the end of an archive on its own.
pub trait NarCopy: Send + Sync {
    /// Copy one archive from `from` to `to`, returning the bytes moved.
    fn copy<R, W>(
        &self,
        from: &mut R,
        to: &mut W,
    ) -> impl Future<Output = std::io::Result<u64>> + Send
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send;
}

/// [`NarCopy`] for payloads that are already delimited by the enclosing
/// framing; copies until EOF.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl NarCopy for Passthrough {
    async fn copy<R, W>(&self, from: &mut R, to: &mut W) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        tokio::io::copy(from, to).await
    }
}

/// Passed to [`daemon::DaemonClient::build_paths`] and
/// [`daemon::DaemonClient::build_derivation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildMode {
    Normal,
    Repair,
    Check,
}

/// Status code of a [`BuildResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    /// "possibly transient", per the reference daemon.
    TransientFailure = 6,
    CachedFailure = 7,
    TimedOut = 8,
    MiscFailure = 9,
    DependencyFailed = 10,
    LogLimitExceeded = 11,
    NotDeterministic = 12,
    ResolvesToAlreadyValid = 13,
    NoSubstituters = 14,
}
impl From<TryFromPrimitiveError<BuildStatus>> for Error {
    fn from(value: TryFromPrimitiveError<BuildStatus>) -> Self {
        Self::Protocol(format!("BuildStatus({:x})", value.number))
    }
}

/// Returned from [`daemon::DaemonClient::build_derivation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    /// Verbatim error message, or "" if none.
    pub error_msg: String,
}

/// A derivation (or output) path plus the outputs requested from it,
/// rendered on the wire as `path!out1,out2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathWithOutputs {
    pub path: StorePath,
    /// Empty means "all outputs".
    pub outputs: BTreeSet<String>,
}

impl PathWithOutputs {
    pub fn render<S: Store>(&self, store: &S) -> String {
        let path = store.print_store_path(&self.path);
        if self.outputs.is_empty() {
            path
        } else {
            let outputs = self.outputs.iter().map(String::as_str).collect::<Vec<_>>();
            format!("{}!{}", path, outputs.join(","))
        }
    }
}

/// Metadata for one valid store path, as returned by
/// [`daemon::DaemonClient::query_path_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    /// The first derivation known to have produced this path, which may no
    /// longer be in the store.
    pub deriver: Option<StorePath>,
    /// Hex SHA-256 over the path's NAR serialization.
    pub nar_hash: String,
    /// Other store paths referenced by this one.
    pub references: BTreeSet<StorePath>,
    /// When the path was registered in the store.
    pub registration_time: DateTime<Utc>,
    pub nar_size: u64,
    /// Whether the path is ultimately trusted, eg. built locally.
    pub ultimate: bool,
    /// Signatures, eg. from a binary cache.
    pub sigs: BTreeSet<String>,
    /// Content address, for paths added by content.
    pub ca: Option<ContentAddress>,
}

/// What a substituter could provide for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutablePathInfo {
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
}

/// Returned from [`daemon::DaemonClient::query_missing`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Missing {
    /// Paths that will be built.
    pub will_build: BTreeSet<StorePath>,
    /// Paths that will be substituted.
    pub will_substitute: BTreeSet<StorePath>,
    /// Paths we don't know what will happen to.
    pub unknown: BTreeSet<StorePath>,
    /// Despite the name, the extracted size of all substituted paths.
    pub download_size: u64,
    /// Total size of all NARs to download from a substituter.
    pub nar_size: u64,
}

/// What garbage collection should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum GcAction {
    /// Only report the live set.
    ReturnLive = 0,
    /// Only report the dead set.
    ReturnDead = 1,
    /// Delete everything unreachable.
    DeleteDead = 2,
    /// Delete the specific paths given, failing if any is live.
    DeleteSpecific = 3,
}

/// Options for [`daemon::DaemonClient::collect_garbage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcOptions {
    pub action: GcAction,
    /// Only meaningful for [`GcAction::DeleteSpecific`].
    pub paths_to_delete: BTreeSet<StorePath>,
    pub ignore_liveness: bool,
    /// Stop after freeing this many bytes.
    pub max_freed: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            paths_to_delete: BTreeSet::new(),
            ignore_liveness: false,
            max_freed: u64::MAX,
        }
    }
}

/// Results of a garbage collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcResults {
    /// Depending on the action: the live set, the dead set, or what was
    /// deleted.
    pub paths: BTreeSet<String>,
    pub bytes_freed: u64,
}

/// Client-side settings uploaded to the daemon right after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Whether to keep temporary directories of failed builds.
    pub keep_failed: bool,
    /// Whether to keep building derivations when another build fails.
    pub keep_going: bool,
    /// Whether to fall back to building from source if a binary substitution
    /// fails.
    pub try_fallback: bool,
    pub verbosity: Verbosity,
    /// Number of derivations the daemon may build in parallel. 0 means no
    /// local builds at all, only remote builds and substitutions.
    pub max_build_jobs: u64,
    /// Seconds a build may produce no output before it is killed. 0 disables
    /// the limit.
    pub max_silent_time: u64,
    /// Whether to show build log output in real time.
    pub verbose_build: bool,
    /// Cores available to one build (`NIX_BUILD_CORES`); 0 means all cores
    /// of the builder machine.
    pub build_cores: u64,
    /// Whether to use binary substitutes if available.
    pub use_substitutes: bool,
    /// Any other settings, sent by name on daemons that accept overrides.
    /// Names owned by the fields above and `show-trace` are dropped before
    /// sending.
    pub overrides: std::collections::HashMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            verbosity: Verbosity::Error,
            max_build_jobs: 1,
            max_silent_time: 0,
            verbose_build: true,
            build_cores: 0,
            use_substitutes: true,
            overrides: std::collections::HashMap::new(),
        }
    }
}
