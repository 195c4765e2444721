//! Streaming HTTP/1.1 response parser.
//!
//! Consumes bytes incrementally out of a [`LineState`] in HTTP mode: status
//! line and headers as CRLF-framed lines, bodies as raw bytes
//! (content-length countdown, chunked with extensions and trailers, or
//! read-until-close). The connection keeps feeding until
//! [`ParseProgress::Complete`] or an error; either ends the exchange.

use crate::error::Error;
use crate::lines::LineState;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseProgress {
    /// The message continues past the buffered data.
    NeedMore,
    /// The message is complete; status and keep-alive are valid.
    Complete,
}

#[derive(Debug)]
enum PState {
    StatusLine,
    Headers,
    Body(u64),
    BodyUntilClose,
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    Done,
}

pub(crate) struct ResponseParser {
    state: PState,
    status: u16,
    http11: bool,
    content_length: Option<u64>,
    chunked: bool,
    conn_close: bool,
    conn_keep_alive: bool,
    /// The request was HEAD, so the response has no body.
    head: bool,
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            state: PState::StatusLine,
            status: 0,
            http11: false,
            content_length: None,
            chunked: false,
            conn_close: false,
            conn_keep_alive: false,
            head: false,
        }
    }

    /// Prepare for the next response.
    pub fn reset(&mut self, head_request: bool) {
        *self = ResponseParser::new();
        self.head = head_request;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn complete(&self) -> bool {
        matches!(self.state, PState::Done)
    }

    /// Whether the server will honor another request on this connection.
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
    /// requires an explicit `Connection: keep-alive`. A read-until-close
    /// body forecloses reuse by construction.
    pub fn keep_alive(&self) -> bool {
        if self.chunked || self.content_length.is_some() || self.no_body() {
            if self.http11 {
                !self.conn_close
            } else {
                self.conn_keep_alive && !self.conn_close
            }
        } else {
            false
        }
    }

    fn no_body(&self) -> bool {
        self.head || self.status < 200 || self.status == 204 || self.status == 304
    }

    /// The peer closed the stream. Completes a read-until-close body;
    /// anything else mid-message is truncation.
    pub fn on_eof(&mut self) -> bool {
        match self.state {
            PState::BodyUntilClose => {
                self.state = PState::Done;
                true
            }
            PState::Done => true,
            _ => false,
        }
    }

    /// Advance over whatever is buffered. Returns `Complete` exactly once
    /// per message.
    pub fn parse(&mut self, line: &mut LineState) -> Result<ParseProgress, Error> {
        loop {
            match self.state {
                PState::StatusLine => {
                    if !line.next() {
                        return Ok(ParseProgress::NeedMore);
                    }
                    self.parse_status_line(line)?;
                    self.state = PState::Headers;
                }
                PState::Headers => {
                    if !line.next() {
                        return Ok(ParseProgress::NeedMore);
                    }
                    if line.line().is_empty() {
                        self.headers_done();
                    } else {
                        self.parse_header(line)?;
                    }
                }
                PState::Body(ref mut remaining) => {
                    let avail = line.raw().len() as u64;
                    if avail == 0 {
                        return Ok(ParseProgress::NeedMore);
                    }
                    let take = avail.min(*remaining);
                    *remaining -= take;
                    let done = *remaining == 0;
                    line.skip_raw(take as usize);
                    if done {
                        self.state = PState::Done;
                    }
                }
                PState::BodyUntilClose => {
                    let avail = line.raw().len();
                    if avail == 0 {
                        return Ok(ParseProgress::NeedMore);
                    }
                    line.skip_raw(avail);
                }
                PState::ChunkSize => {
                    if !line.next() {
                        return Ok(ParseProgress::NeedMore);
                    }
                    let size = parse_chunk_size(line.line())?;
                    if size == 0 {
                        self.state = PState::Trailers;
                    } else {
                        self.state = PState::ChunkData(size);
                    }
                }
                PState::ChunkData(ref mut remaining) => {
                    let avail = line.raw().len() as u64;
                    if avail == 0 {
                        return Ok(ParseProgress::NeedMore);
                    }
                    let take = avail.min(*remaining);
                    *remaining -= take;
                    let done = *remaining == 0;
                    line.skip_raw(take as usize);
                    if done {
                        self.state = PState::ChunkDataEnd;
                    }
                }
                PState::ChunkDataEnd => {
                    // The CRLF after the chunk data frames as an empty line.
                    if !line.next() {
                        return Ok(ParseProgress::NeedMore);
                    }
                    if !line.line().is_empty() {
                        return Err(Error::Protocol("missing CRLF after chunk".to_string()));
                    }
                    self.state = PState::ChunkSize;
                }
                PState::Trailers => {
                    if !line.next() {
                        return Ok(ParseProgress::NeedMore);
                    }
                    if line.line().is_empty() {
                        self.state = PState::Done;
                    }
                }
                PState::Done => return Ok(ParseProgress::Complete),
            }
        }
    }

    fn parse_status_line(&mut self, line: &mut LineState) -> Result<(), Error> {
        self.http11 = {
            let version = line.next_token(b" ");
            match version {
                b"HTTP/1.1" => true,
                b"HTTP/1.0" => false,
                _ => {
                    return Err(Error::Protocol(format!(
                        "bad status line version {:?}",
                        String::from_utf8_lossy(version)
                    )));
                }
            }
        };
        let code = line.next_token(b" ");
        if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
            return Err(Error::Protocol(format!(
                "bad status code {:?}",
                String::from_utf8_lossy(code)
            )));
        }
        self.status = (code[0] - b'0') as u16 * 100
            + (code[1] - b'0') as u16 * 10
            + (code[2] - b'0') as u16;
        Ok(())
    }

    fn parse_header(&mut self, line: &mut LineState) -> Result<(), Error> {
        let l = line.line();
        let colon = match l.iter().position(|&b| b == b':') {
            Some(i) => i,
            None => {
                return Err(Error::Protocol(format!(
                    "header line without colon: {:?}",
                    String::from_utf8_lossy(l)
                )));
            }
        };
        let name = &l[..colon];
        let value = trim_ascii(&l[colon + 1..]);

        if name.eq_ignore_ascii_case(b"Content-Length") {
            let text = std::str::from_utf8(value)
                .map_err(|_| Error::Protocol("bad content-length".to_string()))?;
            let n: u64 = text
                .parse()
                .map_err(|_| Error::Protocol(format!("bad content-length {text:?}")))?;
            self.content_length = Some(n);
        } else if name.eq_ignore_ascii_case(b"Transfer-Encoding") {
            if contains_token(value, b"chunked") {
                self.chunked = true;
            }
        } else if name.eq_ignore_ascii_case(b"Connection") {
            if contains_token(value, b"close") {
                self.conn_close = true;
            }
            if contains_token(value, b"keep-alive") {
                self.conn_keep_alive = true;
            }
        }
        Ok(())
    }

    fn headers_done(&mut self) {
        self.state = if self.no_body() {
            PState::Done
        } else if self.chunked {
            PState::ChunkSize
        } else {
            match self.content_length {
                Some(0) => PState::Done,
                Some(n) => PState::Body(n),
                None => PState::BodyUntilClose,
            }
        };
    }
}

/// Parse a chunk-size line, ignoring any `;extension`.
fn parse_chunk_size(l: &[u8]) -> Result<u64, Error> {
    let digits = match l.iter().position(|&b| b == b';') {
        Some(i) => trim_ascii(&l[..i]),
        None => trim_ascii(l),
    };
    if digits.is_empty() {
        return Err(Error::Protocol("empty chunk size".to_string()));
    }
    let mut size: u64 = 0;
    for &b in digits {
        let d = match b {
            b'0'..=b'9' => (b - b'0') as u64,
            b'a'..=b'f' => (b - b'a') as u64 + 10,
            b'A'..=b'F' => (b - b'A') as u64 + 10,
            _ => {
                return Err(Error::Protocol(format!(
                    "bad chunk size {:?}",
                    String::from_utf8_lossy(l)
                )));
            }
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(d))
            .ok_or_else(|| Error::Protocol("chunk size overflow".to_string()))?;
    }
    Ok(size)
}

fn trim_ascii(mut b: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = b {
        b = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = b {
        b = rest;
    }
    b
}

/// Case-insensitive comma-separated token search.
fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ascii(part).eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(p: &mut ResponseParser, data: &[u8]) -> Result<ParseProgress, Error> {
        let mut ls = LineState::from_bytes(data);
        ls.set_http_mode(true);
        p.parse(&mut ls)
    }

    #[test]
    fn simple_response() {
        let mut p = ResponseParser::new();
        let r = feed(
            &mut p,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nworld",
        )
        .unwrap();
        assert_eq!(r, ParseProgress::Complete);
        assert_eq!(p.status(), 200);
        assert!(p.keep_alive());
    }

    #[test]
    fn response_in_pieces() {
        let mut p = ResponseParser::new();
        let mut ls = LineState::new(256);
        ls.set_http_mode(true);

        let part = b"HTTP/1.1 404 Not";
        ls.read_info()[..part.len()].copy_from_slice(part);
        ls.add_length(part.len());
        assert_eq!(p.parse(&mut ls).unwrap(), ParseProgress::NeedMore);
        assert!(ls.consume());

        let part = b" Found\r\nContent-Length: 4\r\n\r\ngo";
        ls.read_info()[..part.len()].copy_from_slice(part);
        ls.add_length(part.len());
        assert_eq!(p.parse(&mut ls).unwrap(), ParseProgress::NeedMore);
        assert!(ls.consume());

        let part = b"ne";
        ls.read_info()[..part.len()].copy_from_slice(part);
        ls.add_length(part.len());
        assert_eq!(p.parse(&mut ls).unwrap(), ParseProgress::Complete);
        assert_eq!(p.status(), 404);
    }

    #[test]
    fn chunked_with_trailers() {
        let mut p = ResponseParser::new();
        let r = feed(
            &mut p,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6;x=y\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(r, ParseProgress::Complete);
        assert!(p.keep_alive());
    }

    #[test]
    fn connection_close_wins() {
        let mut p = ResponseParser::new();
        feed(
            &mut p,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
        assert!(!p.keep_alive());
    }

    #[test]
    fn http10_defaults_to_close() {
        let mut p = ResponseParser::new();
        feed(&mut p, b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(!p.keep_alive());

        p.reset(false);
        feed(
            &mut p,
            b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert!(p.keep_alive());
    }

    #[test]
    fn body_until_close() {
        let mut p = ResponseParser::new();
        let r = feed(&mut p, b"HTTP/1.1 200 OK\r\n\r\nsome body text").unwrap();
        assert_eq!(r, ParseProgress::NeedMore);
        assert!(!p.keep_alive());
        assert!(p.on_eof());
        assert!(p.complete());
    }

    #[test]
    fn eof_mid_message_is_truncation() {
        let mut p = ResponseParser::new();
        let r = feed(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhal").unwrap();
        assert_eq!(r, ParseProgress::NeedMore);
        assert!(!p.on_eof());
    }

    #[test]
    fn no_body_statuses() {
        let mut p = ResponseParser::new();
        let r = feed(&mut p, b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(r, ParseProgress::Complete);

        p.reset(true);
        let r = feed(
            &mut p,
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n",
        )
        .unwrap();
        assert_eq!(r, ParseProgress::Complete, "HEAD response has no body");
    }

    #[test]
    fn malformed_inputs() {
        let mut p = ResponseParser::new();
        assert!(feed(&mut p, b"HTTP/2 200 OK\r\n\r\n").is_err());
        p.reset(false);
        assert!(feed(&mut p, b"HTTP/1.1 2x0 OK\r\n\r\n").is_err());
        p.reset(false);
        assert!(feed(&mut p, b"HTTP/1.1 200 OK\r\nNoColonHere\r\n\r\n").is_err());
        p.reset(false);
        assert!(feed(
            &mut p,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"
        )
        .is_err());
    }
}
