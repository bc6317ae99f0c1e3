//! Transparency encoding for the `DATA` stream (RFC 5321 §4.5.2).

/// Incremental encoder for message content sent after `DATA`.
///
/// Lines starting with `.` get an extra `.`, bare `LF` becomes `CRLF`, and
/// [`DotStuffer::finish`] appends the terminating `.` line. State is kept
/// across calls so chunk boundaries may fall anywhere.
#[derive(Debug, Clone)]
pub struct DotStuffer {
    at_line_start: bool,
    previous: Option<u8>,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            at_line_start: true,
            previous: None,
        }
    }

    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len() + input.len() / 64);

        for &byte in input {
            if self.at_line_start && byte == b'.' {
                out.push(b'.');
            }

            if byte == b'\n' && self.previous != Some(b'\r') {
                out.push(b'\r');
            }

            out.push(byte);
            self.at_line_start = byte == b'\n';
            self.previous = Some(byte);
        }
    }

    /// Terminate the last line if needed and append `.` `CRLF`.
    pub fn finish(self, out: &mut Vec<u8>) {
        if !self.at_line_start {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b".\r\n");
    }
}
