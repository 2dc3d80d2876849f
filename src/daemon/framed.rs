// SPDX-FileCopyrightText: 2024 embr <git@liclac.eu>
// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

//! Write side of the framed streaming protocol used for large uploads.
//!
//! Each frame is a u64 length followed by that many bytes; a zero-length
//! frame terminates the stream. Daemons from minor 23 on receive big
//! request bodies this way, while concurrently emitting log messages on the
//! same connection.

use crate::{DaemonError, Error, Result};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::wire;

/// Bytes buffered before a frame goes out.
const FRAME_CAPACITY: usize = 64 * 1024;

/// [`AsyncWrite`] that partitions its input into length-prefixed frames.
///
/// The `failure` slot is shared with the stderr drain running concurrently
/// on the same connection. Once it holds an error, further writes are
/// refused and [`FramedSink::finish`] surfaces the daemon's error instead
/// of sending the terminator, so an upload the daemon has already rejected
/// cannot wedge the connection.
pub(crate) struct FramedSink<'a, W: AsyncWrite + Unpin> {
    inner: &'a mut W,
    failure: &'a Mutex<Option<DaemonError>>,
    chunk: BytesMut,
    pending: Option<Frame>,
}

struct Frame {
    header: [u8; 8],
    header_written: usize,
    data: BytesMut,
}

impl<'a, W: AsyncWrite + Unpin> FramedSink<'a, W> {
    pub(crate) fn new(inner: &'a mut W, failure: &'a Mutex<Option<DaemonError>>) -> Self {
        Self {
            inner,
            failure,
            chunk: BytesMut::with_capacity(FRAME_CAPACITY),
            pending: None,
        }
    }

    fn daemon_failure(&self) -> Option<DaemonError> {
        self.failure.lock().clone()
    }

    /// Freezes the current chunk into a frame. The chunk may be empty only
    /// on the flush path, which never calls this.
    fn start_frame(&mut self) {
        let data = self.chunk.split();
        self.pending = Some(Frame {
            header: (data.len() as u64).to_le_bytes(),
            header_written: 0,
            data,
        });
    }

    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while let Some(frame) = self.pending.as_mut() {
            if frame.header_written < 8 {
                let n = ready!(
                    Pin::new(&mut *self.inner).poll_write(cx, &frame.header[frame.header_written..])
                )?;
                if n == 0 {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                }
                frame.header_written += n;
            } else if frame.data.has_remaining() {
                let n = ready!(Pin::new(&mut *self.inner).poll_write(cx, frame.data.chunk()))?;
                if n == 0 {
                    return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
                }
                frame.data.advance(n);
            } else {
                self.pending = None;
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Flushes buffered data and sends the zero-length end-of-stream frame.
    pub(crate) async fn finish(mut self) -> Result<()> {
        if let Some(err) = self.daemon_failure() {
            return Err(Error::Daemon(err));
        }
        AsyncWriteExt::flush(&mut self).await?;
        wire::write_u64(self.inner, 0).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FramedSink<'_, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx))?;
        if this.daemon_failure().is_some() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "daemon failed during framed transfer",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let take = buf.len().min(FRAME_CAPACITY - this.chunk.len());
        this.chunk.extend_from_slice(&buf[..take]);
        if this.chunk.len() >= FRAME_CAPACITY {
            this.start_frame();
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx))?;
        if this.daemon_failure().is_some() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "daemon failed during framed transfer",
            )));
        }
        if !this.chunk.is_empty() {
            this.start_frame();
            ready!(this.poll_pending(cx))?;
        }
        Pin::new(&mut *this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.poll_flush(cx)
    }
}
