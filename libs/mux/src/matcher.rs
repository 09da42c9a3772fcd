//! Connection matchers.
//!
//! A matcher looks at the bytes sniffed so far and answers [`MatchResult::Match`],
//! [`MatchResult::NoMatch`] or [`MatchResult::NeedMore`]. Matchers are pure functions of
//! the buffer; the multiplexer re-evaluates them after every read.
//!
//! Some peers send nothing useful until the server speaks first. A matcher
//! can hand the multiplexer a [`Matcher::reply`] for those, and later point
//! out the peer's acknowledgement with [`Matcher::find_ack`] so it is cut
//! from the bytes the protocol handler sees.

use std::ops::Range;
use std::panic;

use tracing::{debug, trace};

/// Outcome of evaluating a matcher against a sniff buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The connection belongs to this matcher.
    Match,
    /// The connection definitely does not belong to this matcher.
    NoMatch,
    /// Undecided; more bytes are required.
    NeedMore,
}

/// Position of the peer's acknowledgement of a [`Matcher::reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// These bytes of the sniff buffer; they are not replayed.
    At(Range<usize>),
    /// Not received yet.
    Pending,
    /// Will not show up in a form this matcher recognises.
    Lost,
}

/// A predicate over a connection's leading bytes.
pub trait Matcher: Send + Sync + 'static {
    /// Classify the bytes read so far.
    fn check(&self, buf: &[u8]) -> MatchResult;

    /// Whether this matcher accepts every connection.
    ///
    /// Every multiplexer needs exactly one catch-all, registered last.
    fn is_catch_all(&self) -> bool {
        false
    }

    /// Bytes the peer must receive before it sends what [`Matcher::check`]
    /// is waiting for.
    ///
    /// Asked while this matcher holds classification at `NeedMore`. At most
    /// one reply is written per connection.
    fn reply(&self, _buf: &[u8]) -> Option<&'static [u8]> {
        None
    }

    /// Find the peer's acknowledgement of [`Matcher::reply`] in `buf`.
    ///
    /// Asked only on connections this matcher replied to, whichever route
    /// won them.
    fn find_ack(&self, _buf: &[u8]) -> Ack {
        Ack::Lost
    }
}

impl<F> Matcher for F
where
    F: Fn(&[u8]) -> MatchResult + Send + Sync + 'static,
{
    fn check(&self, buf: &[u8]) -> MatchResult {
        self(buf)
    }
}

/// Matches every connection without reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Matcher for Any {
    fn check(&self, _buf: &[u8]) -> MatchResult {
        MatchResult::Match
    }

    fn is_catch_all(&self) -> bool {
        true
    }
}

/// Matches connections starting with a literal byte prefix.
#[derive(Debug, Clone)]
pub struct Prefix(Vec<u8>);

impl Prefix {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self(prefix.into())
    }
}

impl Matcher for Prefix {
    fn check(&self, buf: &[u8]) -> MatchResult {
        match_prefix(&self.0, buf)
    }
}

fn match_prefix(prefix: &[u8], buf: &[u8]) -> MatchResult {
    if buf.len() >= prefix.len() {
        if buf.starts_with(prefix) {
            MatchResult::Match
        } else {
            MatchResult::NoMatch
        }
    } else if prefix.starts_with(buf) {
        MatchResult::NeedMore
    } else {
        MatchResult::NoMatch
    }
}

/// Request methods recognised by [`Http1Fast`].
const HTTP1_METHODS: &[&[u8]] = &[
    b"OPTIONS ",
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"TRACE ",
    b"CONNECT ",
    b"PATCH ",
];

/// Matches HTTP/1.x by looking only at the request method.
///
/// Cheap: decides after at most eight bytes, without parsing the request line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1Fast;

impl Matcher for Http1Fast {
    fn check(&self, buf: &[u8]) -> MatchResult {
        let mut need_more = false;
        for method in HTTP1_METHODS {
            match match_prefix(method, buf) {
                MatchResult::Match => return MatchResult::Match,
                MatchResult::NeedMore => need_more = true,
                MatchResult::NoMatch => {}
            }
        }

        if need_more {
            MatchResult::NeedMore
        } else {
            MatchResult::NoMatch
        }
    }
}

/// HTTP/2 client connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;

const FRAME_HEADERS: u8 = 0x1;
const FRAME_PRIORITY: u8 = 0x2;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_PING: u8 = 0x6;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// Empty server SETTINGS frame, a valid server connection preface.
pub const HTTP2_EMPTY_SETTINGS: &[u8] = &[0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0];

struct FrameHeader {
    frame_type: u8,
    flags: u8,
    stream_id: u32,
    /// Payload bounds within the buffer.
    payload: Range<usize>,
}

/// Parse the frame header at `pos`. `None` until all nine bytes are there.
fn frame_header(buf: &[u8], pos: usize) -> Option<FrameHeader> {
    let header = buf.get(pos..pos + FRAME_HEADER_LEN)?;
    let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let start = pos + FRAME_HEADER_LEN;

    Some(FrameHeader {
        frame_type: header[3],
        flags: header[4],
        stream_id: u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff,
        payload: start..start + length,
    })
}

#[derive(Debug, Clone)]
enum FieldValue {
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
}

/// Matches an HTTP/2 connection whose first header block carries a field.
///
/// Reads the client preface, skips connection-level frames and decodes the
/// first HEADERS block (including CONTINUATION frames) with HPACK.
///
/// Once the preface is in, it replies with an empty SETTINGS frame: some
/// clients wait for the server's SETTINGS before sending any request.
#[derive(Debug, Clone)]
pub struct Http2HeaderField {
    name: Vec<u8>,
    value: FieldValue,
}

impl Http2HeaderField {
    /// Match when `name` is present with exactly `value`.
    pub fn new(name: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.as_ref().to_ascii_lowercase(),
            value: FieldValue::Exact(value.into()),
        }
    }

    /// Match when `name` is present with a value starting with `prefix`.
    pub fn with_prefix(name: impl AsRef<[u8]>, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.as_ref().to_ascii_lowercase(),
            value: FieldValue::Prefix(prefix.into()),
        }
    }

    /// gRPC: `content-type: application/grpc` (including `+proto` etc.).
    pub fn grpc() -> Self {
        Self::with_prefix("content-type", "application/grpc")
    }

    fn field_matches(&self, name: &[u8], value: &[u8]) -> bool {
        if !name.eq_ignore_ascii_case(&self.name) {
            return false;
        }
        match &self.value {
            FieldValue::Exact(expected) => value == expected.as_slice(),
            FieldValue::Prefix(prefix) => value.starts_with(prefix),
        }
    }

    fn decode_block(&self, block: &[u8]) -> MatchResult {
        // hpack panics instead of failing on some malformed blocks.
        let decoded = panic::catch_unwind(|| hpack::Decoder::new().decode(block));
        match decoded {
            Ok(Ok(fields)) => {
                if fields
                    .iter()
                    .any(|(name, value)| self.field_matches(name, value))
                {
                    MatchResult::Match
                } else {
                    MatchResult::NoMatch
                }
            }
            Ok(Err(e)) => {
                trace!(error = ?e, "HPACK decode failed");
                MatchResult::NoMatch
            }
            Err(_) => {
                debug!(len = block.len(), "HPACK decoder panicked on malformed header block");
                MatchResult::NoMatch
            }
        }
    }
}

impl Matcher for Http2HeaderField {
    fn check(&self, buf: &[u8]) -> MatchResult {
        match match_prefix(HTTP2_PREFACE, buf) {
            MatchResult::Match => {}
            other => return other,
        }

        let mut pos = HTTP2_PREFACE.len();
        let mut block = Vec::new();
        let mut open_stream: Option<u32> = None;

        loop {
            let Some(frame) = frame_header(buf, pos) else {
                return MatchResult::NeedMore;
            };
            let Some(payload) = buf.get(frame.payload.clone()) else {
                return MatchResult::NeedMore;
            };

            match (open_stream, frame.frame_type) {
                (Some(open), FRAME_CONTINUATION) if open == frame.stream_id => {
                    block.extend_from_slice(payload);
                    if frame.flags & FLAG_END_HEADERS != 0 {
                        return self.decode_block(&block);
                    }
                }
                // Anything interleaved with an unfinished header block is a
                // protocol error.
                (Some(_), _) => return MatchResult::NoMatch,
                (None, FRAME_HEADERS) => {
                    let Some(fragment) = header_fragment(payload, frame.flags) else {
                        return MatchResult::NoMatch;
                    };
                    block.extend_from_slice(fragment);
                    if frame.flags & FLAG_END_HEADERS != 0 {
                        return self.decode_block(&block);
                    }
                    open_stream = Some(frame.stream_id);
                }
                (None, FRAME_SETTINGS | FRAME_WINDOW_UPDATE | FRAME_PING | FRAME_PRIORITY) => {}
                (None, _) => return MatchResult::NoMatch,
            }

            pos = frame.payload.end;
        }
    }

    fn reply(&self, buf: &[u8]) -> Option<&'static [u8]> {
        buf.starts_with(HTTP2_PREFACE).then_some(HTTP2_EMPTY_SETTINGS)
    }

    fn find_ack(&self, buf: &[u8]) -> Ack {
        if !buf.starts_with(HTTP2_PREFACE) {
            return Ack::Lost;
        }

        // Every SETTINGS ACK in the sniff buffer answers our reply: the
        // protocol handler has not written anything yet.
        let mut pos = HTTP2_PREFACE.len();
        while let Some(frame) = frame_header(buf, pos) {
            if frame.payload.end > buf.len() {
                break;
            }
            if frame.frame_type == FRAME_SETTINGS && frame.flags & FLAG_ACK != 0 {
                return Ack::At(pos..frame.payload.end);
            }
            pos = frame.payload.end;
        }
        Ack::Pending
    }
}

/// Strip padding and priority fields from a HEADERS payload.
fn header_fragment(payload: &[u8], flags: u8) -> Option<&[u8]> {
    let mut start = 0;
    let mut end = payload.len();

    if flags & FLAG_PADDED != 0 {
        let pad = *payload.first()? as usize;
        start += 1;
        end = end.checked_sub(pad)?;
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }

    if start > end {
        return None;
    }
    Some(&payload[start..end])
}
