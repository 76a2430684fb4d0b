//! Line framing and data-line escaping.
//!
//! Lines are LF terminated with an optional CR and carry at most
//! [`MAX_LINE_LEN`] content bytes. Payload bytes travel in `D` lines where
//! `%`, CR, LF and NUL are percent-escaped.

use crate::error::{Error, Result};

/// Maximum line size including the CR LF terminator.
pub const LINELENGTH: usize = 1002;

/// Maximum number of content bytes in one line.
pub const MAX_LINE_LEN: usize = LINELENGTH - 2;

/// Largest escaped payload carried by a single `D` line.
pub const MAX_DATA_PAYLOAD: usize = MAX_LINE_LEN - 2;

fn needs_escape(byte: u8) -> bool {
    matches!(byte, b'%' | b'\r' | b'\n' | 0)
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    if needs_escape(byte) {
        out.push(b'%');
        out.push(HEX[(byte >> 4) as usize]);
        out.push(HEX[(byte & 0x0F) as usize]);
    } else {
        out.push(byte);
    }
}

/// Percent-escape `data` for a `D` line.
pub fn escape_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        push_escaped(&mut out, byte);
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Reverse [`escape_data`]. Any `%XX` sequence is decoded, not only the
/// four mandatory ones.
pub fn unescape_data(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'%' {
            out.push(data[i]);
            i += 1;
            continue;
        }
        let high = data.get(i + 1).copied().and_then(hex_value);
        let low = data.get(i + 2).copied().and_then(hex_value);
        match (high, low) {
            (Some(high), Some(low)) => out.push((high << 4) | low),
            _ => {
                return Err(Error::Syntax(format!(
                    "invalid escape sequence at offset {}",
                    i
                )))
            }
        }
        i += 3;
    }
    Ok(out)
}

/// Assembles lines from the raw inbound byte stream.
///
/// Bytes beyond the current line stay buffered for the next call. An
/// over-long line is reported once and the rest of it, up to its LF, is
/// dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    data: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        LineBuffer::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Pop the next complete line without its terminator.
    ///
    /// `None` means more input is needed.
    pub fn take_line(&mut self) -> Option<Result<Vec<u8>>> {
        if self.discarding {
            match self.data.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.data.drain(..=pos);
                    self.discarding = false;
                }
                None => {
                    self.data.clear();
                    return None;
                }
            }
        }

        match self.data.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line: Vec<u8> = self.data.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.len() > MAX_LINE_LEN {
                    return Some(Err(Error::LineTooLong));
                }
                Some(Ok(line))
            }
            // One extra byte is tolerated for a CR whose LF has not arrived.
            None if self.data.len() > MAX_LINE_LEN + 1 => {
                self.data.clear();
                self.discarding = true;
                Some(Err(Error::LineTooLong))
            }
            None => None,
        }
    }

    /// Whether a full line can be taken without reading.
    pub fn has_line(&self) -> bool {
        let mut lines = self.data.iter().filter(|&&b| b == b'\n');
        if self.discarding {
            lines.next();
        }
        lines.next().is_some()
    }

    /// Called when the transport reported end of file.
    pub fn finish(&mut self) -> Error {
        let partial = !self.data.is_empty() && !self.discarding;
        self.data.clear();
        self.discarding = false;
        if partial {
            Error::IncompleteLine
        } else {
            Error::Eof
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.discarding = false;
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Packs payload bytes into `D` lines no longer than the line limit.
#[derive(Debug, Default)]
pub struct DataLineEncoder {
    line: Vec<u8>,
}

impl DataLineEncoder {
    pub fn new() -> Self {
        DataLineEncoder::default()
    }

    /// Escape `data` into the pending line, handing every full line to
    /// `emit` (content only, without terminator).
    pub fn push<F>(&mut self, data: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut escaped = Vec::with_capacity(3);
        for &byte in data {
            escaped.clear();
            push_escaped(&mut escaped, byte);
            if self.line.is_empty() {
                self.line.extend_from_slice(b"D ");
            }
            if self.line.len() + escaped.len() > MAX_LINE_LEN {
                emit(&self.line)?;
                self.line.clear();
                self.line.extend_from_slice(b"D ");
            }
            self.line.extend_from_slice(&escaped);
        }
        Ok(())
    }

    /// Emit a partially filled line, if any.
    pub fn flush<F>(&mut self, mut emit: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        if self.line.len() > 2 {
            emit(&self.line)?;
        }
        self.line.clear();
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.line.len() <= 2
    }

    /// Drop anything buffered without sending it.
    pub fn reset(&mut self) {
        self.line.clear();
    }
}

/// Split a line into its first word and the remainder, skipping the
/// separating blanks.
pub fn split_word(line: &[u8]) -> (&[u8], &[u8]) {
    let end = line
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(line.len());
    let mut rest = &line[end..];
    while let Some((&first, tail)) = rest.split_first() {
        if first != b' ' && first != b'\t' {
            break;
        }
        rest = tail;
    }
    (&line[..end], rest)
}

/// Whether `line` starts with the reserved token `keyword`, followed by a
/// blank or the end of the line.
pub fn starts_with_token(line: &[u8], keyword: &[u8]) -> bool {
    line.starts_with(keyword)
        && matches!(line.get(keyword.len()), None | Some(b' ') | Some(b'\t'))
}
