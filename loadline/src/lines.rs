//! Buffered line-oriented reader.
//!
//! [`LineState`] frames lines out of a fixed byte buffer that is filled
//! externally (from a socket or a file) through the `read_info`/`add_length`
//! handshake. Two framing modes: the default terminates lines on LF (an
//! immediately preceding CR is excluded from the content), HTTP mode
//! terminates on CRLF and preserves empty lines so a blank line can end a
//! header block. Bytes past the last framed line are reachable as raw data
//! for body consumption.

use std::io::Read;

pub struct LineState {
    buf: Vec<u8>,
    /// One past the last filled byte.
    write_pos: usize,
    /// Start of the most recently framed line.
    line_start: usize,
    /// End of the framed line's content (terminator excluded).
    line_end: usize,
    /// First byte after the framed line's terminator; also the raw cursor.
    next_start: usize,
    /// Token cursor within the framed line.
    tok_pos: usize,
    http_mode: bool,
    line_complete: bool,
}

impl LineState {
    /// Create an empty reader with a fixed capacity.
    pub fn new(capacity: usize) -> Self {
        LineState {
            buf: vec![0; capacity],
            write_pos: 0,
            line_start: 0,
            line_end: 0,
            next_start: 0,
            tok_pos: 0,
            http_mode: false,
            line_complete: false,
        }
    }

    /// Wrap an already-filled region. The buffer has no free space.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut ls = LineState::new(data.len());
        ls.buf.copy_from_slice(data);
        ls.write_pos = data.len();
        ls
    }

    /// Switch between LF framing (default) and CRLF framing.
    pub fn set_http_mode(&mut self, on: bool) {
        self.http_mode = on;
    }

    /// The free suffix of the buffer, for an external fill.
    pub fn read_info(&mut self) -> &mut [u8] {
        &mut self.buf[self.write_pos..]
    }

    /// Commit `n` bytes written into `read_info`.
    pub fn add_length(&mut self, n: usize) {
        debug_assert!(self.write_pos + n <= self.buf.len());
        self.write_pos += n;
    }

    /// Attempt to frame the next line. Returns true iff a complete line
    /// (content plus terminator) is present.
    pub fn next(&mut self) -> bool {
        self.line_start = self.next_start;
        self.tok_pos = self.line_start;
        if self.http_mode {
            let mut i = self.line_start;
            while i < self.write_pos && self.buf[i] != b'\r' && self.buf[i] != b'\n' {
                i += 1;
            }
            if i >= self.write_pos {
                self.line_end = self.line_start;
                self.line_complete = false;
                return false;
            }
            self.line_end = i;
            if self.buf[i] == b'\r' {
                if i + 1 >= self.write_pos {
                    // CR at the end of the fill: the LF may still be in
                    // flight, so the line is not complete yet.
                    self.line_end = self.line_start;
                    self.line_complete = false;
                    return false;
                }
                i += 1;
                if self.buf[i] == b'\n' {
                    i += 1;
                }
            } else {
                i += 1;
            }
            self.next_start = i;
        } else {
            let mut i = self.line_start;
            while i < self.write_pos && self.buf[i] != b'\n' {
                i += 1;
            }
            if i >= self.write_pos {
                self.line_end = self.line_start;
                self.line_complete = false;
                return false;
            }
            self.line_end = if i > self.line_start && self.buf[i - 1] == b'\r' {
                i - 1
            } else {
                i
            };
            self.next_start = i + 1;
        }
        self.line_complete = true;
        true
    }

    /// The last framed line, terminator excluded. Empty if no line is framed.
    pub fn line(&self) -> &[u8] {
        if !self.line_complete {
            return &[];
        }
        &self.buf[self.line_start..self.line_end]
    }

    /// The next token of the framed line, split on any byte in `delims`.
    /// The run of delimiters following the token is consumed, so repeated
    /// delimiters do not produce empty tokens. Returns empty once exhausted.
    pub fn next_token(&mut self, delims: &[u8]) -> &[u8] {
        if !self.line_complete || self.tok_pos >= self.line_end {
            return &[];
        }
        let start = self.tok_pos;
        let mut i = start;
        while i < self.line_end && !delims.contains(&self.buf[i]) {
            i += 1;
        }
        let end = i;
        while i < self.line_end && delims.contains(&self.buf[i]) {
            i += 1;
        }
        self.tok_pos = i;
        &self.buf[start..end]
    }

    /// Bytes past the last framed line, not yet consumed.
    pub fn raw(&self) -> &[u8] {
        &self.buf[self.next_start..self.write_pos]
    }

    /// Consume `n` raw bytes. Line framing restarts after the skipped region.
    pub fn skip_raw(&mut self, n: usize) {
        debug_assert!(self.next_start + n <= self.write_pos);
        self.next_start += n;
        self.line_start = self.next_start;
        self.line_end = self.next_start;
        self.tok_pos = self.next_start;
        self.line_complete = false;
    }

    /// Compact unread bytes to the front of the buffer, making room for more
    /// fill. Returns false iff the unread region already fills the buffer,
    /// which means a single line exceeds the capacity.
    pub fn consume(&mut self) -> bool {
        let keep = self.write_pos - self.next_start;
        if keep > 0 && self.next_start > 0 {
            self.buf.copy_within(self.next_start..self.write_pos, 0);
        }
        self.write_pos = keep;
        self.line_start = 0;
        self.line_end = 0;
        self.next_start = 0;
        self.tok_pos = 0;
        self.line_complete = false;
        keep < self.buf.len()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.line_start = 0;
        self.line_end = 0;
        self.next_start = 0;
        self.tok_pos = 0;
        self.line_complete = false;
    }

    /// Fill from a reader. Returns the number of bytes added; zero means
    /// end of stream or a full buffer.
    pub fn read_file<R: Read>(&mut self, r: &mut R) -> std::io::Result<usize> {
        let space = self.read_info();
        if space.is_empty() {
            return Ok(0);
        }
        let n = r.read(space)?;
        self.write_pos += n;
        Ok(n)
    }
}
