//! Sniff buffer and replaying stream.
//!
//! Classification reads the leading bytes of a connection into an owned
//! buffer. The connection is then handed over as a [`Sniffed`] stream, which
//! yields the buffered bytes before reading from the socket again, so the
//! protocol handler sees the byte stream exactly as the peer sent it. The
//! only exception is a peer's acknowledgement of a matcher's reply, which
//! the handler never asked for and is not shown.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use crate::error::SniffError;
use crate::matcher::{Ack, Matcher, MatchResult};

/// Default maximum bytes buffered while classifying a connection.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

/// Default depth of each derived listener's queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Configuration for connection classification.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Give up on a connection that has not been classified within this time.
    /// `None` waits for as long as the socket does.
    pub timeout: Option<Duration>,
    /// Maximum bytes to read before forcing a decision.
    pub max_bytes: usize,
    /// Classified connections buffered per derived listener.
    pub queue_depth: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// A connection whose leading bytes were consumed for classification.
///
/// Reads drain the sniffed bytes first, then forward to the inner stream.
/// Writes always go straight to the inner stream.
#[derive(Debug)]
pub struct Sniffed<Io> {
    sniffed: Bytes,
    inner: Io,
}

impl<Io> Sniffed<Io> {
    pub fn new(inner: Io, sniffed: Bytes) -> Self {
        Self { sniffed, inner }
    }

    /// Sniffed bytes that have not been read yet.
    pub fn pending(&self) -> &[u8] {
        &self.sniffed
    }
}

impl<Io: AsyncRead + Unpin> AsyncRead for Sniffed<Io> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.sniffed.is_empty() {
            let n = self.sniffed.len().min(buf.remaining());
            buf.put_slice(&self.sniffed[..n]);
            self.sniffed.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<Io: AsyncWrite + Unpin> AsyncWrite for Sniffed<Io> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Result of evaluating the whole matcher list once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Matched(usize),
    Unmatched,
    /// The matcher at this index needs more bytes.
    Undecided(usize),
}

/// Evaluate matchers in priority order.
///
/// A `NeedMore` from a higher priority matcher blocks lower priority ones
/// until it decides. With `last_chance` set no more data will arrive, so
/// `NeedMore` counts as `NoMatch`.
pub(crate) fn evaluate<'a, I>(matchers: I, buf: &[u8], last_chance: bool) -> Verdict
where
    I: IntoIterator<Item = &'a dyn Matcher>,
{
    for (index, matcher) in matchers.into_iter().enumerate() {
        match matcher.check(buf) {
            MatchResult::Match => return Verdict::Matched(index),
            MatchResult::NoMatch => {}
            MatchResult::NeedMore if last_chance => {}
            MatchResult::NeedMore => return Verdict::Undecided(index),
        }
    }
    Verdict::Unmatched
}

/// Read from `stream` until one of `matchers` decides.
///
/// Returns the index of the winning matcher; the bytes read are left in
/// `buf`. Reads only as much as the peer has sent, up to `max_bytes`.
///
/// The first undecided matcher with a [`Matcher::reply`] gets it written to
/// the peer. After a decision the peer's acknowledgement of that reply is
/// awaited and cut from `buf`.
pub(crate) async fn classify<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    matchers: &[&dyn Matcher],
    max_bytes: usize,
) -> Result<usize, SniffError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut replied: Option<usize> = None;

    let index = loop {
        let full = buf.len() >= max_bytes;
        match evaluate(matchers.iter().copied(), buf, full) {
            Verdict::Matched(index) => break index,
            Verdict::Unmatched => return Err(SniffError::Unmatched),
            Verdict::Undecided(blocking) => {
                if replied.is_none() {
                    if let Some(reply) = matchers[blocking].reply(buf) {
                        stream.write_all(reply).await?;
                        stream.flush().await?;
                        trace!(matcher = blocking, len = reply.len(), "Replied while sniffing");
                        replied = Some(blocking);
                    }
                }
            }
        }

        if read_more(stream, buf, max_bytes).await? == 0 {
            if buf.is_empty() {
                return Err(SniffError::Empty);
            }
            match evaluate(matchers.iter().copied(), buf, true) {
                Verdict::Matched(index) => break index,
                _ => return Err(SniffError::Unmatched),
            }
        }
    };

    if let Some(replier) = replied {
        strip_ack(stream, buf, matchers[replier], max_bytes).await?;
    }
    Ok(index)
}

/// Wait for the acknowledgement `matcher` expects and remove it from `buf`.
///
/// Gives up, leaving `buf` untouched, once the buffer is full or the peer
/// stops sending.
async fn strip_ack<R>(
    stream: &mut R,
    buf: &mut BytesMut,
    matcher: &dyn Matcher,
    max_bytes: usize,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        match matcher.find_ack(buf) {
            Ack::At(range) => {
                let tail = buf.split_off(range.end);
                buf.truncate(range.start);
                buf.unsplit(tail);
                return Ok(());
            }
            Ack::Lost => return Ok(()),
            Ack::Pending => {}
        }

        if buf.len() >= max_bytes || read_more(stream, buf, max_bytes).await? == 0 {
            debug!(sniffed = buf.len(), "Reply was not acknowledged, replaying as is");
            return Ok(());
        }
    }
}

/// One read into `buf`, never past `max_bytes`. Returns the bytes read.
async fn read_more<R>(stream: &mut R, buf: &mut BytesMut, max_bytes: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let want = max_bytes - buf.len();
    buf.reserve(want);
    (&mut *stream).take(want as u64).read_buf(buf).await
}
