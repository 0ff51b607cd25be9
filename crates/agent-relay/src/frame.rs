//! Line framing for the tool's output pipes.
//!
//! [`RecordCodec`] turns stdout into [`Record`]s: one per newline-terminated
//! line, structured when the line is JSON and raw text otherwise.
//! [`TextLineCodec`] does the same splitting for stderr but always yields
//! text. Both keep the unterminated tail of the buffer until more bytes
//! arrive, and flush it as a final line at EOF. No line length limit is
//! applied.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::Decoder;

/// One decoded line of tool output.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// A line that parsed as JSON.
    Event(Value),
    /// A line that did not parse as JSON, verbatim.
    Raw(String),
    /// A line that was not valid UTF-8. `text` is the lossy decoding.
    Malformed { text: String, error: String },
}

impl Record {
    /// Decode a single line (without its terminator). Blank lines yield `None`.
    pub fn from_line(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        match std::str::from_utf8(bytes) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(match serde_json::from_str::<Value>(text) {
                Ok(value) => Record::Event(value),
                Err(_) => Record::Raw(text.to_string()),
            }),
            Err(e) => Some(Record::Malformed {
                text: String::from_utf8_lossy(bytes).into_owned(),
                error: e.to_string(),
            }),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Record::Event(_))
    }
}

/// Newline scanner shared by both codecs.
#[derive(Debug, Default)]
struct LineSplitter {
    /// Bytes before this index are known not to contain a newline.
    next_index: usize,
}

impl LineSplitter {
    fn next_line(&mut self, buf: &mut BytesMut) -> Option<BytesMut> {
        match buf[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = self.next_index + offset;
                self.next_index = 0;
                let mut line = buf.split_to(newline + 1);
                line.truncate(newline);
                Some(line)
            }
            None => {
                self.next_index = buf.len();
                None
            }
        }
    }

    fn remainder(&mut self, buf: &mut BytesMut) -> Option<BytesMut> {
        self.next_index = 0;
        if buf.is_empty() {
            None
        } else {
            Some(buf.split())
        }
    }
}

/// Decoder for the tool's stdout.
#[derive(Debug, Default)]
pub struct RecordCodec {
    lines: LineSplitter,
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Self::Error> {
        while let Some(line) = self.lines.next_line(buf) {
            if let Some(record) = Record::from_line(&line) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Record>, Self::Error> {
        if let Some(record) = self.decode(buf)? {
            return Ok(Some(record));
        }
        Ok(self
            .lines
            .remainder(buf)
            .and_then(|line| Record::from_line(&line)))
    }
}

/// Decoder for the tool's stderr: lossy UTF-8 lines, blank lines skipped.
#[derive(Debug, Default)]
pub struct TextLineCodec {
    lines: LineSplitter,
}

fn text_line(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        None
    } else {
        Some(text.into_owned())
    }
}

impl Decoder for TextLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        while let Some(line) = self.lines.next_line(buf) {
            if let Some(text) = text_line(&line) {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(text) = self.decode(buf)? {
            return Ok(Some(text));
        }
        Ok(self.lines.remainder(buf).and_then(|line| text_line(&line)))
    }
}

/// Truncate a line for logging.
pub fn preview(line: &str, max_chars: usize) -> String {
    match line.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}
