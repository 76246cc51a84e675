//! Incremental line framing.
//!
//! A `LineBuffer` accumulates raw reads and hands back whole lines
//! under a configured terminator policy, with two special modes: SMTP
//! body mode (dot-unstuffing, `"\r\n.\r\n"` ends the body) and expect
//! mode (exactly N octets, used for BDAT chunks).
//!
//! Bytes added are delivered exactly once and in order; the partial
//! tail is retained across calls. Lines are delivered without their
//! terminator, with the terminator length reported so that callers can
//! tell an empty read from an empty line.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Terminator {
    CrLf,
    Lf,
    /// Lock onto CRLF or LF at the first terminator seen.
    Auto,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Scanned {
    /// A complete line, terminator stripped, in body mode already
    /// unstuffed.
    Line { data: Vec<u8>, eol_len: usize },
    /// The `"."` end-of-body marker (body mode only, not delivered as
    /// a line). The buffer drops back to line mode.
    EndOfBody,
    /// Part of the fixed-length region opened with `expect`.
    Chunk(Vec<u8>),
}

#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    terminator: Terminator,
    body_mode: bool,
    expect: usize,
}

impl LineBuffer {
    pub fn new(terminator: Terminator) -> LineBuffer {
        LineBuffer {
            buf: Vec::new(),
            terminator,
            body_mode: false,
            expect: 0,
        }
    }

    /// A buffer framing an SMTP DATA body: CRLF lines, dot-unstuffed,
    /// ended by the lone-dot line.
    pub fn smtp_body() -> LineBuffer {
        LineBuffer {
            buf: Vec::new(),
            terminator: Terminator::CrLf,
            body_mode: true,
            expect: 0,
        }
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Switches to expect mode: the next `n` octets are handed back
    /// verbatim as `Chunk`s, then the buffer reverts to line mode.
    pub fn expect(&mut self, n: usize) {
        self.expect = n;
    }

    /// True while an `expect` region is still open.
    pub fn expecting(&self) -> bool {
        self.expect > 0
    }

    pub fn next(&mut self) -> Option<Scanned> {
        if self.expect > 0 {
            if self.buf.is_empty() {
                return None;
            }
            let n = self.expect.min(self.buf.len());
            let chunk = self.buf.drain(..n).collect();
            self.expect -= n;
            return Some(Scanned::Chunk(chunk));
        }
        let (pos, eol_len) = self.find_terminator()?;
        let mut data: Vec<u8> = self.buf.drain(..pos + eol_len).collect();
        data.truncate(pos);
        if self.body_mode {
            if data == b"." {
                self.body_mode = false;
                return Some(Scanned::EndOfBody);
            }
            if data.first() == Some(&b'.') {
                data.remove(0);
            }
        }
        Some(Scanned::Line { data, eol_len })
    }

    /// Runs `handler` over every complete item currently buffered.
    pub fn apply(&mut self, mut handler: impl FnMut(Scanned)) {
        while let Some(item) = self.next() {
            handler(item);
        }
    }

    /// The retained partial tail, without consuming it.
    pub fn fragment(&self) -> &[u8] {
        &self.buf
    }

    /// Takes everything still buffered (used to hand pipelined bytes
    /// that follow an end-of-body back to the command loop).
    pub fn take_remainder(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn find_terminator(&mut self) -> Option<(usize, usize)> {
        match self.terminator {
            Terminator::CrLf => {
                let pos = find(&self.buf, b"\r\n")?;
                Some((pos, 2))
            }
            Terminator::Lf => {
                let pos = self.buf.iter().position(|&b| b == b'\n')?;
                Some((pos, 1))
            }
            Terminator::Auto => {
                let pos = self.buf.iter().position(|&b| b == b'\n')?;
                if pos > 0 && self.buf[pos - 1] == b'\r' {
                    self.terminator = Terminator::CrLf;
                    Some((pos - 1, 2))
                } else {
                    self.terminator = Terminator::Lf;
                    Some((pos, 1))
                }
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
