//! HTTP chunked transport framing.
//!
//! The worker speaks just enough HTTP/1.1 to survive proxies: a request line,
//! headers, and a chunked body. The first chunk of a request body is the
//! control frame, the following chunks are stdin. Response bodies carry
//! sentinel-delimited segments:
//!
//! ```text
//! stdoutSTART\n<bytes>stdoutEND\n      (repeated, concatenated)
//! stderrSTART\n<bytes>stderrEND\n      (repeated, concatenated)
//! exitcodeSTART\n<code>exitcodeEND\n   (once, last)
//! ```
//!
//! All decoders here are push-based: callers feed whatever bytes the socket
//! returned and the decoder keeps the partial state. None of them assume
//! anything about segment boundaries.

use super::{ControlFrame, InvocationOutput, NO_EXIT_CODE};
use crate::constants::{
    EXITCODE_END, EXITCODE_START, INPUT_CHUNK_SIZE, MAX_CHUNK_SIZE_LINE, MAX_CONTROL_FRAME_SIZE,
    MAX_HEADER_SIZE, STDERR_END, STDERR_START, STDOUT_END, STDOUT_START,
};
use crate::error::{Error, Result};
use bytes::Bytes;

/// Terminating zero-length chunk.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// =============================================================================
// Head Parsing
// =============================================================================

/// Parsed start line and headers of a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHead {
    /// Request line or status line.
    pub start_line: String,
    /// Headers in arrival order, names lowercased.
    pub headers: Vec<(String, String)>,
}

impl HttpHead {
    /// Parses a head block (without the terminating blank line).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] on non-UTF-8 input, an empty start
    /// line, or a header without a colon.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::ProtocolParse("header block is not UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");
        let start_line = lines.next().unwrap_or_default().trim().to_string();
        if start_line.is_empty() {
            return Err(Error::ProtocolParse("empty start line".to_string()));
        }
        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::ProtocolParse(format!("malformed header line '{line}'")))?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        Ok(Self {
            start_line,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true for `Transfer-Encoding: chunked`.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Parses `Content-Length`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] if the value is not a number.
    pub fn content_length(&self) -> Result<Option<usize>> {
        self.header("content-length")
            .map(|v| {
                v.parse()
                    .map_err(|_| Error::ProtocolParse(format!("invalid content-length '{v}'")))
            })
            .transpose()
    }

    /// Parses the status code of a response status line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] if the start line is not
    /// `HTTP/x.y <code> ...`.
    pub fn status_code(&self) -> Result<u16> {
        let mut parts = self.start_line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(version), Some(code)) if version.starts_with("HTTP/") => code
                .parse()
                .map_err(|_| Error::ProtocolParse(format!("invalid status code '{code}'"))),
            _ => Err(Error::ProtocolParse(format!(
                "invalid status line '{}'",
                self.start_line
            ))),
        }
    }
}

/// Accumulates bytes until the blank line that ends the head.
#[derive(Debug, Default)]
struct HeadReader {
    buf: Vec<u8>,
}

impl HeadReader {
    /// Returns the parsed head and whatever body bytes followed it.
    fn feed(&mut self, input: &[u8]) -> Result<Option<(HttpHead, Vec<u8>)>> {
        let search_from = self.buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        self.buf.extend_from_slice(input);
        match find(&self.buf[search_from..], HEAD_TERMINATOR) {
            Some(rel) => {
                let marker = search_from + rel;
                let head = HttpHead::parse(&self.buf[..marker])?;
                let rest = self.buf.split_off(marker + HEAD_TERMINATOR.len());
                self.buf.clear();
                Ok(Some((head, rest)))
            }
            None if self.buf.len() > MAX_HEADER_SIZE => Err(Error::ProtocolParse(format!(
                "header block exceeds {MAX_HEADER_SIZE} bytes"
            ))),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Chunked Transfer Decoding
// =============================================================================

/// Output of [`ChunkedDecoder::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEvent {
    /// Payload bytes of the current chunk (a chunk may arrive in pieces).
    Data(Bytes),
    /// The current chunk is complete.
    ChunkEnd,
    /// Zero-length chunk and trailers consumed; the body is complete.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataCr,
    DataLf,
    Trailer,
    Done,
}

/// Decoder for `Transfer-Encoding: chunked` bodies.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    /// Creates a decoder positioned at the first chunk-size line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
        }
    }

    /// Returns true once the terminating chunk has been consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Consumes `input`, appending decoded events to `events`.
    ///
    /// Returns the number of bytes consumed; bytes after the terminating
    /// chunk are left unconsumed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] on a malformed size line or missing
    /// chunk delimiter.
    pub fn feed(&mut self, input: &[u8], events: &mut Vec<ChunkEvent>) -> Result<usize> {
        let mut pos = 0;
        while pos < input.len() {
            match self.state {
                ChunkState::Size | ChunkState::Trailer => {
                    let Some(nl) = input[pos..].iter().position(|&b| b == b'\n') else {
                        self.push_line(&input[pos..])?;
                        return Ok(input.len());
                    };
                    self.push_line(&input[pos..pos + nl])?;
                    pos += nl + 1;
                    let line = std::mem::take(&mut self.line);
                    let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
                    if self.state == ChunkState::Trailer {
                        if line.is_empty() {
                            self.state = ChunkState::Done;
                            events.push(ChunkEvent::End);
                            return Ok(pos);
                        }
                        continue;
                    }
                    let size = parse_chunk_size(line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min(input.len() - pos);
                    events.push(ChunkEvent::Data(Bytes::copy_from_slice(
                        &input[pos..pos + take],
                    )));
                    pos += take;
                    self.state = if take == remaining {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data(remaining - take)
                    };
                }
                ChunkState::DataCr => {
                    match input[pos] {
                        b'\r' => self.state = ChunkState::DataLf,
                        b'\n' => {
                            self.state = ChunkState::Size;
                            events.push(ChunkEvent::ChunkEnd);
                        }
                        other => {
                            return Err(Error::ProtocolParse(format!(
                                "expected CRLF after chunk data, got byte {other:#04x}"
                            )));
                        }
                    }
                    pos += 1;
                }
                ChunkState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(Error::ProtocolParse(
                            "expected LF after chunk data".to_string(),
                        ));
                    }
                    pos += 1;
                    self.state = ChunkState::Size;
                    events.push(ChunkEvent::ChunkEnd);
                }
                ChunkState::Done => return Ok(pos),
            }
        }
        Ok(pos)
    }

    fn push_line(&mut self, bytes: &[u8]) -> Result<()> {
        self.line.extend_from_slice(bytes);
        if self.line.len() > MAX_CHUNK_SIZE_LINE {
            return Err(Error::ProtocolParse(format!(
                "chunk line exceeds {MAX_CHUNK_SIZE_LINE} bytes"
            )));
        }
        Ok(())
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::ProtocolParse("chunk size is not UTF-8".to_string()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| Error::ProtocolParse(format!("invalid chunk size '{digits}'")))
}

/// Appends `data` as one chunk. Empty data is skipped, since a zero-length
/// chunk terminates the body.
pub fn encode_chunk(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

// =============================================================================
// Sentinel Segments
// =============================================================================

/// Kind of sentinel-delimited segment in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Process stdout.
    Stdout,
    /// Process stderr.
    Stderr,
    /// Process exit code.
    ExitCode,
}

impl Segment {
    const ALL: [Segment; 3] = [Segment::Stdout, Segment::Stderr, Segment::ExitCode];

    /// Opening marker.
    #[must_use]
    pub fn start_marker(self) -> &'static [u8] {
        match self {
            Self::Stdout => STDOUT_START,
            Self::Stderr => STDERR_START,
            Self::ExitCode => EXITCODE_START,
        }
    }

    /// Closing marker.
    #[must_use]
    pub fn end_marker(self) -> &'static [u8] {
        match self {
            Self::Stdout => STDOUT_END,
            Self::Stderr => STDERR_END,
            Self::ExitCode => EXITCODE_END,
        }
    }
}

/// Demultiplexes a sentinel-framed body into stdout, stderr and exit code.
#[derive(Debug, Default)]
pub struct SentinelScanner {
    buf: Vec<u8>,
    current: Option<Segment>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: Vec<u8>,
    exit_seen: bool,
}

impl SentinelScanner {
    /// Creates an empty scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] if bytes outside any segment do not
    /// begin a known marker.
    pub fn feed(&mut self, input: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(input);
        loop {
            match self.current {
                None => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    if let Some(seg) = Segment::ALL
                        .into_iter()
                        .find(|s| self.buf.starts_with(s.start_marker()))
                    {
                        self.buf.drain(..seg.start_marker().len());
                        self.current = Some(seg);
                        continue;
                    }
                    if Segment::ALL
                        .iter()
                        .any(|s| s.start_marker().starts_with(&self.buf))
                    {
                        return Ok(());
                    }
                    let preview = String::from_utf8_lossy(&self.buf[..self.buf.len().min(32)]);
                    return Err(Error::ProtocolParse(format!(
                        "unexpected bytes outside segment: {preview:?}"
                    )));
                }
                Some(seg) => {
                    let end = seg.end_marker();
                    if let Some(pos) = find(&self.buf, end) {
                        let data: Vec<u8> = self.buf.drain(..pos).collect();
                        self.sink(seg).extend_from_slice(&data);
                        self.buf.drain(..end.len());
                        if seg == Segment::ExitCode {
                            self.exit_seen = true;
                        }
                        self.current = None;
                        continue;
                    }
                    // Hold back a tail that could be the start of the end marker.
                    let keep = end.len() - 1;
                    if self.buf.len() > keep {
                        let flush = self.buf.len() - keep;
                        let data: Vec<u8> = self.buf.drain(..flush).collect();
                        self.sink(seg).extend_from_slice(&data);
                    }
                    return Ok(());
                }
            }
        }
    }

    fn sink(&mut self, seg: Segment) -> &mut Vec<u8> {
        match seg {
            Segment::Stdout => &mut self.stdout,
            Segment::Stderr => &mut self.stderr,
            Segment::ExitCode => &mut self.exit,
        }
    }

    /// Returns true once the exit code segment has closed.
    #[must_use]
    pub fn has_exit_code(&self) -> bool {
        self.exit_seen
    }

    /// Produces the collected output.
    ///
    /// A missing exit code is tolerated only when stderr is non-empty (the
    /// worker failed to spawn the process) and yields [`NO_EXIT_CODE`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] on an unterminated segment, an
    /// unparsable exit code, or a body with neither exit code nor stderr.
    pub fn finish(self) -> Result<InvocationOutput> {
        if let Some(seg) = self.current {
            return Err(Error::ProtocolParse(format!(
                "body ended inside {seg:?} segment"
            )));
        }
        if !self.buf.is_empty() {
            return Err(Error::ProtocolParse(
                "body ended with a partial marker".to_string(),
            ));
        }
        let stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        let code = if self.exit_seen {
            parse_exit_code(&self.exit)?
        } else if !stderr.is_empty() {
            NO_EXIT_CODE
        } else {
            return Err(Error::ProtocolParse("response carried no exit code".to_string()));
        };
        Ok(InvocationOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr,
            code,
        })
    }
}

fn parse_exit_code(raw: &[u8]) -> Result<i32> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text == "null" {
        return Ok(NO_EXIT_CODE);
    }
    text.parse()
        .map_err(|_| Error::ProtocolParse(format!("invalid exit code '{text}'")))
}

// =============================================================================
// Client Side: Request Encoding / Response Decoding
// =============================================================================

/// Encodes a streaming invocation request: control frame as the first chunk,
/// `input` split into further chunks, then the terminating chunk.
///
/// # Errors
///
/// Returns error if the control frame cannot be serialized.
pub fn encode_request(host: &str, control: &ControlFrame, input: &[u8]) -> Result<Vec<u8>> {
    let control = control.to_json()?;
    let mut out = Vec::with_capacity(control.len() + input.len() + 256);
    out.extend_from_slice(
        format!(
            "POST / HTTP/1.1\r\nhost: {host}\r\ncontent-type: application/octet-stream\r\ntransfer-encoding: chunked\r\n\r\n"
        )
        .as_bytes(),
    );
    encode_chunk(&mut out, control.as_bytes());
    for piece in input.chunks(INPUT_CHUNK_SIZE) {
        encode_chunk(&mut out, piece);
    }
    out.extend_from_slice(LAST_CHUNK);
    Ok(out)
}

/// Encodes a control-only request whose whole body is the control frame.
///
/// # Errors
///
/// Returns error if the control frame cannot be serialized.
pub fn encode_control_request(host: &str, control: &ControlFrame) -> Result<Vec<u8>> {
    let control = control.to_json()?;
    let mut out = format!(
        "POST / HTTP/1.1\r\nhost: {host}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
        control.len()
    )
    .into_bytes();
    out.extend_from_slice(control.as_bytes());
    Ok(out)
}

#[derive(Debug)]
enum BodyReader {
    Chunked(ChunkedDecoder),
    Length(usize),
    UntilClose,
}

#[derive(Debug)]
enum ResponseState {
    Head(HeadReader),
    Body(BodyReader),
    Done,
}

/// Decodes a worker response from raw socket bytes.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: ResponseState,
    scanner: SentinelScanner,
    received: usize,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDecoder {
    /// Creates a decoder expecting a status line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ResponseState::Head(HeadReader::default()),
            scanner: SentinelScanner::new(),
            received: 0,
        }
    }

    /// Returns true once the body is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.state, ResponseState::Done)
    }

    /// Total bytes fed so far.
    #[must_use]
    pub fn bytes_received(&self) -> usize {
        self.received
    }

    /// Consumes socket bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] on malformed HTTP or sentinel framing,
    /// or a non-200 status.
    pub fn feed(&mut self, input: &[u8]) -> Result<()> {
        self.received += input.len();
        let mut input = input.to_vec();
        loop {
            match &mut self.state {
                ResponseState::Head(reader) => {
                    let Some((head, rest)) = reader.feed(&input)? else {
                        return Ok(());
                    };
                    let status = head.status_code()?;
                    if status != 200 {
                        return Err(Error::ProtocolParse(format!(
                            "worker responded with status {status}"
                        )));
                    }
                    self.state = if head.is_chunked() {
                        ResponseState::Body(BodyReader::Chunked(ChunkedDecoder::new()))
                    } else {
                        match head.content_length()? {
                            Some(0) => ResponseState::Done,
                            Some(n) => ResponseState::Body(BodyReader::Length(n)),
                            None => ResponseState::Body(BodyReader::UntilClose),
                        }
                    };
                    input = rest;
                }
                ResponseState::Body(BodyReader::Chunked(decoder)) => {
                    let mut events = Vec::new();
                    decoder.feed(&input, &mut events)?;
                    let done = decoder.is_done();
                    for event in events {
                        if let ChunkEvent::Data(data) = event {
                            self.scanner.feed(&data)?;
                        }
                    }
                    if done {
                        self.state = ResponseState::Done;
                    }
                    return Ok(());
                }
                ResponseState::Body(BodyReader::Length(remaining)) => {
                    let take = (*remaining).min(input.len());
                    *remaining -= take;
                    let done = *remaining == 0;
                    self.scanner.feed(&input[..take])?;
                    if done {
                        self.state = ResponseState::Done;
                    }
                    return Ok(());
                }
                ResponseState::Body(BodyReader::UntilClose) => {
                    return self.scanner.feed(&input);
                }
                ResponseState::Done => return Ok(()),
            }
        }
    }

    /// Produces the output after the body completed or the peer closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the peer closed before sending a
    /// complete response, otherwise see [`SentinelScanner::finish`].
    pub fn finish(self) -> Result<InvocationOutput> {
        match self.state {
            ResponseState::Done | ResponseState::Body(BodyReader::UntilClose) => {
                self.scanner.finish()
            }
            ResponseState::Head(_) => Err(Error::ConnectionClosed(
                "worker closed connection before responding".to_string(),
            )),
            ResponseState::Body(_) => Err(Error::ConnectionClosed(
                "worker closed connection mid-response".to_string(),
            )),
        }
    }
}

// =============================================================================
// Server Side: Request Decoding / Response Encoding
// =============================================================================

/// Output of [`RequestDecoder::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    /// Control frame recovered. `streaming` is false for content-length
    /// requests, which carry no stdin.
    Control {
        /// Process to spawn.
        frame: ControlFrame,
        /// Whether stdin chunks follow.
        streaming: bool,
    },
    /// Stdin bytes.
    Stdin(Bytes),
    /// Stdin reached EOF.
    StdinEnd,
}

#[derive(Debug)]
enum RequestState {
    Head(HeadReader),
    Chunked {
        decoder: ChunkedDecoder,
        control_done: bool,
    },
    Length(usize),
    Done,
}

/// Decodes an invocation request from raw socket bytes.
#[derive(Debug)]
pub struct RequestDecoder {
    state: RequestState,
    control: Vec<u8>,
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDecoder {
    /// Creates a decoder expecting a request line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RequestState::Head(HeadReader::default()),
            control: Vec::new(),
        }
    }

    /// Returns true once stdin EOF has been emitted.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, RequestState::Done)
    }

    /// Consumes socket bytes, appending decoded events to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolParse`] on malformed HTTP, a missing or
    /// invalid control frame, or a request with neither chunked encoding nor
    /// content length.
    pub fn feed(&mut self, input: &[u8], events: &mut Vec<RequestEvent>) -> Result<()> {
        let mut input = input.to_vec();
        loop {
            match &mut self.state {
                RequestState::Head(reader) => {
                    let Some((head, rest)) = reader.feed(&input)? else {
                        return Ok(());
                    };
                    self.state = if head.is_chunked() {
                        RequestState::Chunked {
                            decoder: ChunkedDecoder::new(),
                            control_done: false,
                        }
                    } else {
                        match head.content_length()? {
                            Some(0) => {
                                return Err(Error::ProtocolParse("empty request body".to_string()));
                            }
                            Some(n) if n > MAX_CONTROL_FRAME_SIZE => {
                                return Err(Error::ProtocolParse(format!(
                                    "control frame exceeds {MAX_CONTROL_FRAME_SIZE} bytes"
                                )));
                            }
                            Some(n) => RequestState::Length(n),
                            None => {
                                return Err(Error::ProtocolParse(
                                    "request has neither chunked encoding nor content-length"
                                        .to_string(),
                                ));
                            }
                        }
                    };
                    input = rest;
                }
                RequestState::Chunked {
                    decoder,
                    control_done,
                } => {
                    let mut chunk_events = Vec::new();
                    decoder.feed(&input, &mut chunk_events)?;
                    for event in chunk_events {
                        match (event, *control_done) {
                            (ChunkEvent::Data(data), false) => {
                                self.control.extend_from_slice(&data);
                                if self.control.len() > MAX_CONTROL_FRAME_SIZE {
                                    return Err(Error::ProtocolParse(format!(
                                        "control frame exceeds {MAX_CONTROL_FRAME_SIZE} bytes"
                                    )));
                                }
                            }
                            (ChunkEvent::ChunkEnd, false) => {
                                let frame = ControlFrame::from_slice(&self.control)?;
                                self.control.clear();
                                *control_done = true;
                                events.push(RequestEvent::Control {
                                    frame,
                                    streaming: true,
                                });
                            }
                            (ChunkEvent::End, false) => {
                                return Err(Error::ProtocolParse(
                                    "request ended before control frame".to_string(),
                                ));
                            }
                            (ChunkEvent::Data(data), true) => {
                                events.push(RequestEvent::Stdin(data));
                            }
                            (ChunkEvent::ChunkEnd, true) => {}
                            (ChunkEvent::End, true) => {
                                events.push(RequestEvent::StdinEnd);
                            }
                        }
                    }
                    if decoder.is_done() {
                        self.state = RequestState::Done;
                    }
                    return Ok(());
                }
                RequestState::Length(remaining) => {
                    let take = (*remaining).min(input.len());
                    *remaining -= take;
                    let done = *remaining == 0;
                    self.control.extend_from_slice(&input[..take]);
                    if done {
                        let frame = ControlFrame::from_slice(&self.control)?;
                        self.control.clear();
                        events.push(RequestEvent::Control {
                            frame,
                            streaming: false,
                        });
                        events.push(RequestEvent::StdinEnd);
                        self.state = RequestState::Done;
                    }
                    return Ok(());
                }
                RequestState::Done => return Ok(()),
            }
        }
    }
}

/// Response head for a streamed (chunked) worker response.
#[must_use]
pub fn response_head() -> Vec<u8> {
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    format!("HTTP/1.1 200 OK\r\nserver: fedrun\r\ndate: {date}\r\ntransfer-encoding: chunked\r\n\r\n")
        .into_bytes()
}

/// Appends one sentinel segment, wrapped in a chunk.
pub fn encode_segment(out: &mut Vec<u8>, segment: Segment, data: &[u8]) {
    let mut payload =
        Vec::with_capacity(segment.start_marker().len() + data.len() + segment.end_marker().len());
    payload.extend_from_slice(segment.start_marker());
    payload.extend_from_slice(data);
    payload.extend_from_slice(segment.end_marker());
    encode_chunk(out, &payload);
}

/// Appends the exit code segment and the terminating chunk. A missing code
/// (process killed by a signal) is written as `null`.
pub fn encode_exit(out: &mut Vec<u8>, code: Option<i32>) {
    let code = code.map_or_else(|| "null".to_string(), |c| c.to_string());
    encode_segment(out, Segment::ExitCode, code.as_bytes());
    out.extend_from_slice(LAST_CHUNK);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> Vec<u8> {
        let mut out = response_head();
        encode_segment(&mut out, Segment::Stdout, b"O");
        encode_segment(&mut out, Segment::Stdout, b"K");
        encode_exit(&mut out, Some(0));
        out
    }

    fn decode_in_pieces(raw: &[u8], size: usize) -> InvocationOutput {
        let mut decoder = ResponseDecoder::new();
        for piece in raw.chunks(size) {
            decoder.feed(piece).unwrap();
        }
        assert!(decoder.is_complete());
        decoder.finish().unwrap()
    }

    #[test]
    fn test_response_chunk_sizes() {
        let raw = sample_response();
        for size in [1, 7, 4096] {
            let out = decode_in_pieces(&raw, size);
            assert_eq!(out.stdout, "OK");
            assert_eq!(out.stderr, "");
            assert_eq!(out.code, 0);
        }
    }

    #[test]
    fn test_content_length_response() {
        let body = b"exitcodeSTART\n3exitcodeEND\n";
        let mut raw = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(body);
        let out = decode_in_pieces(&raw, 5);
        assert_eq!(out.code, 3);
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn test_spawn_failure_response() {
        let mut raw = response_head();
        encode_segment(&mut raw, Segment::Stderr, b"Error: spawn nope ENOENT");
        raw.extend_from_slice(LAST_CHUNK);
        let out = decode_in_pieces(&raw, 3);
        assert_eq!(out.code, NO_EXIT_CODE);
        assert!(out.stderr.contains("ENOENT"));
        assert!(out.check_exit_and_stderr().is_err());
    }

    #[test]
    fn test_stdout_containing_partial_marker() {
        let mut raw = response_head();
        encode_segment(&mut raw, Segment::Stdout, b"stdoutEN");
        encode_exit(&mut raw, Some(0));
        let out = decode_in_pieces(&raw, 1);
        assert_eq!(out.stdout, "stdoutEN");
    }

    #[test]
    fn test_garbage_outside_segment() {
        let mut scanner = SentinelScanner::new();
        assert!(scanner.feed(b"hello world and more bytes").is_err());
    }

    #[test]
    fn test_non_200_status() {
        let mut decoder = ResponseDecoder::new();
        let err = decoder
            .feed(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n")
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_truncated_response_is_hangup() {
        let raw = sample_response();
        let mut decoder = ResponseDecoder::new();
        decoder.feed(&raw[..raw.len() - 10]).unwrap();
        assert!(decoder.finish().unwrap_err().is_connection_reset());

        let decoder = ResponseDecoder::new();
        assert!(decoder.finish().unwrap_err().is_connection_reset());
    }

    #[test]
    fn test_request_roundtrip_chunked() {
        let frame = ControlFrame::new("cat", vec![]);
        let raw = encode_request("127.0.0.1:8101", &frame, b"hello stdin").unwrap();
        for size in [1, 7, 4096] {
            let mut decoder = RequestDecoder::new();
            let mut events = Vec::new();
            for piece in raw.chunks(size) {
                decoder.feed(piece, &mut events).unwrap();
            }
            assert!(decoder.is_done());
            assert_eq!(
                events[0],
                RequestEvent::Control {
                    frame: frame.clone(),
                    streaming: true
                }
            );
            let stdin: Vec<u8> = events
                .iter()
                .filter_map(|e| match e {
                    RequestEvent::Stdin(b) => Some(b.to_vec()),
                    _ => None,
                })
                .flatten()
                .collect();
            assert_eq!(stdin, b"hello stdin");
            assert_eq!(events.last(), Some(&RequestEvent::StdinEnd));
        }
    }

    #[test]
    fn test_request_content_length() {
        let frame = ControlFrame::readiness_echo();
        let raw = encode_control_request("localhost", &frame).unwrap();
        let mut decoder = RequestDecoder::new();
        let mut events = Vec::new();
        decoder.feed(&raw, &mut events).unwrap();
        assert_eq!(
            events,
            vec![
                RequestEvent::Control {
                    frame,
                    streaming: false
                },
                RequestEvent::StdinEnd
            ]
        );
    }

    #[test]
    fn test_chunk_extension_and_trailer() {
        let mut decoder = ChunkedDecoder::new();
        let mut events = Vec::new();
        let consumed = decoder
            .feed(b"3;ext=1\r\nabc\r\n0\r\nx-trailer: 1\r\n\r\nextra", &mut events)
            .unwrap();
        assert!(decoder.is_done());
        assert_eq!(consumed, 33);
        assert_eq!(
            events,
            vec![
                ChunkEvent::Data(Bytes::from_static(b"abc")),
                ChunkEvent::ChunkEnd,
                ChunkEvent::End
            ]
        );
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut events = Vec::new();
        assert!(decoder.feed(b"zz\r\n", &mut events).is_err());
    }
}
