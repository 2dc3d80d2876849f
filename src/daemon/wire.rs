// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! Low-level helpers for the daemon wire format.
//!
//! Everything on the wire is built from 64-bit little-endian integers and
//! length-prefixed, zero-padded byte strings. Store paths and content
//! addresses travel as strings; their interpretation is delegated to the
//! [`Store`] service.

use crate::{
    daemon::Proto, ContentAddress, Error, LoggerField, Result, ResultExt, StorePath, Store,
    ValidPathInfo, Verbosity,
};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::future::OptionFuture;
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use std::collections::{BTreeMap, BTreeSet};
use tap::{Tap, TapFallible};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tracing::{instrument, trace};

/// Magic number sent by the client.
pub const WORKER_MAGIC_1: u64 = 0x6e697863;
/// Magic number sent by the daemon.
pub const WORKER_MAGIC_2: u64 = 0x6478696f;
/// Magic number separating entries of a legacy `ImportPaths` stream.
pub const EXPORT_MAGIC: u64 = 0x4558494e;

/// Opcodes understood by daemons in our supported version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum Op {
    IsValidPath = 1,
    HasSubstitutes = 3,
    QueryReferrers = 6,
    AddToStore = 7,
    AddTextToStore = 8,
    BuildPaths = 9,
    EnsurePath = 10,
    AddTempRoot = 11,
    AddIndirectRoot = 12,
    SyncWithGC = 13,
    FindRoots = 14,
    SetOptions = 19,
    CollectGarbage = 20,
    QuerySubstitutablePathInfo = 21,
    QueryDerivationOutputs = 22,
    QueryAllValidPaths = 23,
    QueryPathInfo = 26,
    ImportPaths = 27,
    QueryPathFromHashPart = 29,
    QuerySubstitutablePathInfos = 30,
    QueryValidPaths = 31,
    QuerySubstitutablePaths = 32,
    QueryValidDerivers = 33,
    OptimiseStore = 34,
    VerifyStore = 35,
    BuildDerivation = 36,
    AddSignatures = 37,
    NarFromPath = 38,
    AddToStoreNar = 39,
    QueryMissing = 40,
    QueryDerivationOutputMap = 41,
}

/// Tags on the daemon-to-client stderr side channel. `Last` terminates the
/// stream and hands the wire back to the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum StderrTag {
    Write = 0x64617416,
    Read = 0x64617461,
    Error = 0x63787470,
    Next = 0x6f6c6d67,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
    Last = 0x616c7473,
}

/// Read a u64 from the stream (little endian).
#[instrument(skip(r), level = "trace")]
pub async fn read_u64<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<u64> {
    Ok(r.read_u64_le().await.tap_ok(|v| trace!(v, "<-"))?)
}
/// Write a u64 to the stream (little endian).
#[instrument(skip(w, v), level = "trace")]
pub async fn write_u64<W: AsyncWriteExt + Unpin>(w: &mut W, v: u64) -> std::io::Result<()> {
    Ok(w.write_u64_le(v.tap(|v| trace!(v, "->"))).await?)
}

/// Read a u64 and narrow it to u32, failing if it does not fit.
#[instrument(skip(r), level = "trace")]
pub async fn read_u32<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<u32> {
    let v = read_u64(r).await?;
    u32::try_from(v).map_err(|_| Error::Protocol(format!("integer {} does not fit in u32", v)))
}

/// Read a u64 and narrow it to usize, failing if it does not fit.
#[instrument(skip(r), level = "trace")]
pub async fn read_usize<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<usize> {
    let v = read_u64(r).await?;
    usize::try_from(v).map_err(|_| Error::Protocol(format!("integer {} does not fit in usize", v)))
}

/// Read a boolean from the stream, encoded as u64 (>0 is true).
#[instrument(skip(r), level = "trace")]
pub async fn read_bool<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<bool> {
    Ok(read_u64(r)
        .await
        .map(|v| v > 0)
        .tap_ok(|v| trace!(v, "<-"))?)
}
/// Write a boolean to the stream, encoded as u64.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_bool<W: AsyncWriteExt + Unpin>(w: &mut W, v: bool) -> std::io::Result<()> {
    write_u64(w, if v { 1 } else { 0 }).await
}

/// Read a timestamp (time_t on the wire) from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_datetime<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<DateTime<Utc>> {
    read_u64(r).await.map_err(Into::into).and_then(|ts| {
        DateTime::from_timestamp(ts as i64, 0)
            .ok_or_else(|| Error::Protocol(format!("timestamp {} out of range", ts)))
            .tap_ok(|dt| trace!(?dt, "<-"))
    })
}
/// Write a timestamp (time_t on the wire) to the stream.
#[instrument(skip(w, dt), level = "trace")]
pub async fn write_datetime<W: AsyncWriteExt + Unpin>(w: &mut W, dt: DateTime<Utc>) -> Result<()> {
    let ts: u64 = dt
        .timestamp()
        .try_into()
        .map_err(|_| Error::Protocol(format!("cannot encode pre-epoch timestamp {}", dt)))?;
    Ok(write_u64(w, ts).await?)
}

/// Read a protocol version from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_proto<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Proto> {
    Ok(read_u64(r)
        .await
        .map(Proto::from)
        .tap_ok(|v| trace!(%v, "<-"))?)
}
/// Write a protocol version to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_proto<W: AsyncWriteExt + Unpin>(w: &mut W, v: Proto) -> std::io::Result<()> {
    write_u64(w, v.tap(|v| trace!(%v, "->")).into()).await
}

/// Write an opcode to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_op<W: AsyncWriteExt + Unpin>(w: &mut W, v: Op) -> std::io::Result<()> {
    write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await
}

/// Read a verbosity level from the stream.
#[instrument(skip(r), level = "trace")]
pub async fn read_verbosity<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Verbosity> {
    Ok(read_u64(r).await?.try_into().tap_ok(|v| trace!(?v, "<-"))?)
}
/// Write a verbosity level to the stream.
#[instrument(skip(w, v), level = "trace")]
pub async fn write_verbosity<W: AsyncWriteExt + Unpin>(
    w: &mut W,
    v: Verbosity,
) -> std::io::Result<()> {
    write_u64(w, v.tap(|v| trace!(?v, "->")).into()).await
}

/// Read the tag of the next stderr message.
#[instrument(skip(r), level = "trace")]
pub async fn read_stderr_tag<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<StderrTag> {
    StderrTag::try_from(read_u64(r).await?)
        .map_err(|TryFromPrimitiveError { number }| {
            Error::Protocol(format!("unknown message type {:#x} from daemon", number))
        })
        .tap_ok(|tag| trace!(?tag, "<-"))
}

/// Read a byte blob from the stream. Blobs are prefixed with a u64 length,
/// and the data is padded to the next 8-byte boundary, eg. 1 byte of data
/// occupies 16 bytes on the wire: 8 for the length, 1 for the data, then 7
/// discarded padding bytes. Padding content is not validated.
#[instrument(skip(r), level = "trace")]
pub async fn read_bytes<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let len = read_u64(r).await? as usize;
    let padded = len + pad_len(len);
    let mut buf = vec![0u8; padded];
    r.read_exact(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

/// Read a string from the stream; invalid UTF-8 is replaced, not rejected.
#[instrument(skip(r), level = "trace")]
pub async fn read_string<R: AsyncReadExt + Unpin>(r: &mut R) -> std::io::Result<String> {
    Ok(String::from_utf8_lossy(&read_bytes(r).await?)
        .into_owned()
        .tap(|v| trace!(v, "<-")))
}

/// Write a byte blob to the stream. See [`read_bytes`] for the framing.
#[instrument(skip(w, data), level = "trace")]
pub async fn write_bytes<W: AsyncWriteExt + Unpin>(w: &mut W, data: &[u8]) -> std::io::Result<()> {
    write_u64(w, data.len() as u64).await?;
    if !data.is_empty() {
        w.write_all(data).await?;
        let pad = pad_len(data.len());
        if pad > 0 {
            w.write_all(&[0u8; 7][..pad]).await?;
            trace!(pad, "[ padding ]");
        }
    }
    Ok(())
}

/// Write a string to the stream. A NUL truncates the string, matching what
/// deployed daemons do.
#[instrument(skip(w, s), level = "trace")]
pub async fn write_string<W: AsyncWriteExt + Unpin, S: AsRef<str>>(
    w: &mut W,
    s: S,
) -> std::io::Result<()> {
    let truncated = s.as_ref().split('\0').next().unwrap_or("");
    trace!(v = truncated, "->");
    write_bytes(w, truncated.as_bytes()).await
}

fn pad_len(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Read a list (or set) of strings from the stream - a u64 count, followed
/// by that many strings using the normal `read_string()` encoding.
#[instrument(skip(r), level = "trace")]
pub fn read_strings<R: AsyncReadExt + Unpin>(r: &mut R) -> impl Stream<Item = Result<String>> + '_ {
    try_stream! {
        let count = read_u64(r).await.with_field("<count>")? as usize;
        for _ in 0..count {
            yield read_string(r).await?;
        }
    }
}
/// Write a list of strings to the stream.
#[instrument(skip(w, si), level = "trace")]
pub async fn write_strings<W: AsyncWriteExt + Unpin, I>(w: &mut W, si: I) -> std::io::Result<()>
where
    I: IntoIterator,
    I::IntoIter: ExactSizeIterator,
    I::Item: AsRef<str>,
{
    let si = si.into_iter();
    write_u64(w, si.len() as u64).await?;
    for s in si {
        write_string(w, s.as_ref()).await?;
    }
    Ok(())
}

/// Read a store path, parsed by the store layer.
#[instrument(skip(store, r), level = "trace")]
pub async fn read_store_path<S: Store, R: AsyncReadExt + Unpin>(
    store: &S,
    r: &mut R,
) -> Result<StorePath> {
    let s = read_string(r).await?;
    store.parse_store_path(&s)
}
/// Write a store path, printed by the store layer.
#[instrument(skip(store, w), level = "trace")]
pub async fn write_store_path<S: Store, W: AsyncWriteExt + Unpin>(
    store: &S,
    w: &mut W,
    path: &StorePath,
) -> std::io::Result<()> {
    write_string(w, store.print_store_path(path)).await
}

/// Read an optional store path; the empty string means none.
#[instrument(skip(store, r), level = "trace")]
pub async fn read_opt_store_path<S: Store, R: AsyncReadExt + Unpin>(
    store: &S,
    r: &mut R,
) -> Result<Option<StorePath>> {
    let s = read_string(r).await?;
    if s.is_empty() {
        Ok(None)
    } else {
        store.parse_store_path(&s).map(Some)
    }
}
/// Write an optional store path; none becomes the empty string.
#[instrument(skip(store, w), level = "trace")]
pub async fn write_opt_store_path<S: Store, W: AsyncWriteExt + Unpin>(
    store: &S,
    w: &mut W,
    path: Option<&StorePath>,
) -> std::io::Result<()> {
    match path {
        Some(path) => write_store_path(store, w, path).await,
        None => write_string(w, "").await,
    }
}

/// Read a set of store paths.
#[instrument(skip(store, r), level = "trace")]
pub async fn read_store_paths<S: Store, R: AsyncReadExt + Unpin>(
    store: &S,
    r: &mut R,
) -> Result<BTreeSet<StorePath>> {
    let count = read_usize(r).await.with_field("<count>")?;
    let mut paths = BTreeSet::new();
    for _ in 0..count {
        paths.insert(read_store_path(store, r).await?);
    }
    Ok(paths)
}
/// Write a set of store paths.
#[instrument(skip(store, w, paths), level = "trace")]
pub async fn write_store_paths<S: Store, W: AsyncWriteExt + Unpin>(
    store: &S,
    w: &mut W,
    paths: &BTreeSet<StorePath>,
) -> std::io::Result<()> {
    write_u64(w, paths.len() as u64).await?;
    for path in paths {
        write_store_path(store, w, path).await?;
    }
    Ok(())
}

/// Read an optional content address; the empty string means none.
#[instrument(skip(store, r), level = "trace")]
pub async fn read_opt_content_address<S: Store, R: AsyncReadExt + Unpin>(
    store: &S,
    r: &mut R,
) -> Result<Option<ContentAddress>> {
    let s = read_string(r).await?;
    if s.is_empty() {
        Ok(None)
    } else {
        store.parse_content_address(&s).map(Some)
    }
}
/// Write an optional content address; none becomes the empty string.
#[instrument(skip(store, w), level = "trace")]
pub async fn write_opt_content_address<S: Store, W: AsyncWriteExt + Unpin>(
    store: &S,
    w: &mut W,
    ca: Option<&ContentAddress>,
) -> std::io::Result<()> {
    match ca {
        Some(ca) => write_string(w, store.render_content_address(ca)).await,
        None => write_string(w, "").await,
    }
}

/// Write a map from store path to optional content address.
#[instrument(skip(store, w, paths), level = "trace")]
pub async fn write_store_path_ca_map<S: Store, W: AsyncWriteExt + Unpin>(
    store: &S,
    w: &mut W,
    paths: &BTreeMap<StorePath, Option<ContentAddress>>,
) -> std::io::Result<()> {
    write_u64(w, paths.len() as u64).await?;
    for (path, ca) in paths {
        write_store_path(store, w, path).await?;
        write_opt_content_address(store, w, ca.as_ref()).await?;
    }
    Ok(())
}

/// Read a map from output name to optional store path.
#[instrument(skip(store, r), level = "trace")]
pub async fn read_output_map<S: Store, R: AsyncReadExt + Unpin>(
    store: &S,
    r: &mut R,
) -> Result<BTreeMap<String, Option<StorePath>>> {
    let count = read_usize(r).await.with_field("outputs.<count>")?;
    let mut outputs = BTreeMap::new();
    for _ in 0..count {
        let name = read_string(r).await.with_field("outputs[].name")?;
        let path = read_opt_store_path(store, r)
            .await
            .with_field("outputs[].path")?;
        outputs.insert(name, path);
    }
    Ok(outputs)
}

/// Read the fields attached to an activity or result event.
#[instrument(skip(r), level = "trace")]
pub async fn read_fields<R: AsyncReadExt + Unpin>(r: &mut R) -> Result<Vec<LoggerField>> {
    let count = read_usize(r).await.with_field("fields.<count>")?;
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(
            match read_u64(r).await.with_field("fields[].<type>")? {
                0 => Ok(LoggerField::Int(read_u64(r).await?)),
                1 => Ok(LoggerField::String(read_string(r).await?)),
                t => Err(Error::Protocol(format!("unsupported field type {:#x}", t))),
            }
            .with_field("fields[]")?,
        );
    }
    Ok(fields)
}

/// Read the body of a `ValidPathInfo` reply; the path itself is either the
/// one queried or has just been read from the same stream.
#[instrument(skip(store, r), level = "trace")]
pub async fn read_valid_path_info<S: Store, R: AsyncReadExt + Unpin>(
    store: &S,
    r: &mut R,
    proto: Proto,
    path: StorePath,
) -> Result<ValidPathInfo> {
    let deriver = read_opt_store_path(store, r)
        .await
        .with_field("PathInfo.deriver")?;
    let nar_hash = read_string(r).await.with_field("PathInfo.nar_hash")?;
    let references = read_store_paths(store, r)
        .await
        .with_field("PathInfo.references")?;
    let registration_time = read_datetime(r)
        .await
        .with_field("PathInfo.registration_time")?;
    let nar_size = read_u64(r).await.with_field("PathInfo.nar_size")?;

    let ultimate = OptionFuture::from(proto.since(16).then(|| read_bool(r)))
        .await
        .transpose()
        .with_field("PathInfo.ultimate")?
        .unwrap_or_default();
    let sigs = OptionFuture::from(
        proto
            .since(16)
            .then(|| read_strings(r).collect::<Result<Vec<_>>>()),
    )
    .await
    .transpose()
    .with_field("PathInfo.sigs")?
    .unwrap_or_default()
    .into_iter()
    .collect();
    let ca = OptionFuture::from(proto.since(16).then(|| read_opt_content_address(store, r)))
        .await
        .transpose()
        .with_field("PathInfo.ca")?
        .flatten();

    Ok(ValidPathInfo {
        path,
        deriver,
        nar_hash,
        references,
        registration_time,
        nar_size,
        ultimate,
        sigs,
        ca,
    })
}
