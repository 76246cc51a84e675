//! Client-side dot-stuffing for DATA bodies.

/// Escapes an outgoing body: a `.` starting a line is doubled, and
/// `finish` closes the body with the `CRLF . CRLF` marker (adding the
/// final newline if the content did not end with one).
#[derive(Debug)]
pub struct DotEscaper {
    at_line_start: bool,
    last: u8,
}

impl DotEscaper {
    pub fn new() -> DotEscaper {
        DotEscaper {
            at_line_start: true,
            last: b'\n',
        }
    }

    pub fn escape(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if self.at_line_start && b == b'.' {
                out.push(b'.');
            }
            out.push(b);
            self.at_line_start = b == b'\n';
            self.last = b;
        }
    }

    pub fn finish(self, out: &mut Vec<u8>) {
        if self.last != b'\n' {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
    }
}

impl Default for DotEscaper {
    fn default() -> DotEscaper {
        DotEscaper::new()
    }
}
