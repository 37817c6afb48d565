//! HTTP response parsing
//!
//! `ResponseParser` is an incremental parser: feed it bytes as they arrive
//! and it yields a complete `HttpResponse` once the body framing
//! (`Content-Length`, chunked, or connection close) is satisfied.

use super::chunked::{find_crlf, ChunkedDecoder};
use super::{Error, Headers, HttpResponse, Result, Status, Version};

/// Parse an HTTP response status line
///
/// Format: VERSION STATUS [REASON]
/// Example: HTTP/1.1 200 OK
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let mut parts = line.splitn(3, ' ');

    let version = parts
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::Parse(format!("Invalid status line: {:?}", line)))?
        .parse::<Version>()?;

    let code = parts
        .next()
        .ok_or_else(|| Error::Parse(format!("Invalid status line: {:?}", line)))?;
    let status = code
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", code)))
        .and_then(Status::new)?;

    let reason = match parts.next() {
        Some(reason) => reason.to_string(),
        None => status.reason_phrase().to_string(),
    };

    Ok((version, status, reason))
}

/// How the response body is delimited
#[derive(Debug)]
enum Framing {
    Empty,
    Length(usize),
    Chunked(ChunkedDecoder),
    UntilClose,
}

#[derive(Debug)]
enum ParserState {
    StatusLine,
    Headers,
    Body(Framing),
    Complete,
}

/// HTTP response parser
#[derive(Debug)]
pub struct ResponseParser {
    state: ParserState,
    buffer: Vec<u8>,
    head_request: bool,
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl ResponseParser {
    /// Create a parser for the response to a request
    ///
    /// `head_request` must be set for `HEAD` requests, whose responses carry
    /// framing headers but no body.
    pub fn new(head_request: bool) -> Self {
        ResponseParser {
            state: ParserState::StatusLine,
            buffer: Vec::new(),
            head_request,
            version: Version::default(),
            status: Status::OK,
            reason: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Feed data to the parser
    ///
    /// Returns `Ok(Some(response))` when a complete response is parsed,
    /// `Ok(None)` if more data is needed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.buffer.extend_from_slice(data);

        loop {
            match &mut self.state {
                ParserState::StatusLine => {
                    let Some(eol) = find_crlf(&self.buffer) else { return Ok(None) };
                    let line = String::from_utf8_lossy(&self.buffer[..eol]).into_owned();
                    self.buffer.drain(..eol + 2);

                    // Tolerate stray blank lines between responses
                    if line.is_empty() {
                        continue;
                    }

                    let (version, status, reason) = parse_status_line(&line)?;
                    self.version = version;
                    self.status = status;
                    self.reason = reason;
                    self.headers = Headers::new();
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some(eol) = find_crlf(&self.buffer) else { return Ok(None) };
                    if eol == 0 {
                        self.buffer.drain(..2);
                        self.state = self.after_headers()?;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&self.buffer[..eol]).into_owned();
                    self.buffer.drain(..eol + 2);

                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ParserState::Body(Framing::Empty) => {
                    return Ok(Some(self.complete()));
                }
                ParserState::Body(Framing::Length(remaining)) => {
                    let n = (*remaining).min(self.buffer.len());
                    self.body.extend(self.buffer.drain(..n));
                    *remaining -= n;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    return Ok(Some(self.complete()));
                }
                ParserState::Body(Framing::Chunked(decoder)) => {
                    let (consumed, done) = decoder.decode(&self.buffer, &mut self.body)?;
                    self.buffer.drain(..consumed);
                    if !done {
                        return Ok(None);
                    }
                    return Ok(Some(self.complete()));
                }
                ParserState::Body(Framing::UntilClose) => {
                    self.body.append(&mut self.buffer);
                    return Ok(None);
                }
                ParserState::Complete => return Ok(None),
            }
        }
    }

    /// Signal end of stream
    ///
    /// Completes a close-delimited body; anywhere else EOF means the
    /// connection dropped mid-response.
    pub fn finish(&mut self) -> Result<HttpResponse> {
        match self.state {
            ParserState::Body(Framing::UntilClose) => {
                self.body.append(&mut self.buffer);
                Ok(self.complete())
            }
            _ => Err(Error::ConnectionClosed),
        }
    }

    /// Whether the body of the current response runs until the peer closes
    pub fn reads_until_close(&self) -> bool {
        matches!(self.state, ParserState::Body(Framing::UntilClose))
    }

    fn after_headers(&mut self) -> Result<ParserState> {
        // Interim responses are skipped; the final one follows on the wire
        if self.status.is_informational() && self.status.code() != 101 {
            return Ok(ParserState::StatusLine);
        }

        if self.head_request || self.status.forbids_body() {
            return Ok(ParserState::Body(Framing::Empty));
        }

        if self.headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(ParserState::Body(Framing::Chunked(ChunkedDecoder::new())));
        }

        if let Some(value) = self.headers.get("Content-Length") {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", value)))?;
            return Ok(ParserState::Body(Framing::Length(length)));
        }

        Ok(ParserState::Body(Framing::UntilClose))
    }

    fn complete(&mut self) -> HttpResponse {
        self.state = ParserState::Complete;
        HttpResponse::new(
            self.version,
            self.status,
            std::mem::take(&mut self.reason),
            std::mem::take(&mut self.headers),
            std::mem::take(&mut self.body),
        )
    }
}
