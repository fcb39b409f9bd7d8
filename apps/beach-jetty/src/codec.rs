//! Inbound line framing for peer streams.
//!
//! Peers are arbitrary shells, so a line may carry bytes from any code page
//! or never end at all. Neither case is a transport failure: undecodable bytes
//! are replaced, and an overlong line is discarded up to its terminator and
//! reported as [`PeerLine::Overlong`].

use std::io;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLine {
    Text(String),
    /// A line longer than the codec limit; its bytes were dropped.
    Overlong,
}

#[derive(Debug)]
pub struct PeerLineCodec {
    max_length: usize,
    /// Buffer offset already known to hold no newline.
    scanned: usize,
    discarding: bool,
}

impl PeerLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
            discarding: false,
        }
    }

    fn text(line: &[u8]) -> PeerLine {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        PeerLine::Text(String::from_utf8_lossy(line).into_owned())
    }
}

impl Default for PeerLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PeerLineCodec {
    type Item = PeerLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<PeerLine>> {
        let newline = buf[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
            .map(|offset| self.scanned + offset);

        let Some(end) = newline else {
            if buf.len() > self.max_length {
                buf.clear();
                self.discarding = true;
                self.scanned = 0;
            } else {
                self.scanned = buf.len();
            }
            return Ok(None);
        };

        let line = buf.split_to(end + 1);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) || end > self.max_length {
            return Ok(Some(PeerLine::Overlong));
        }
        Ok(Some(Self::text(&line[..end])))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<PeerLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            buf.clear();
            return Ok(Some(PeerLine::Overlong));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(Some(Self::text(&rest)))
    }
}
