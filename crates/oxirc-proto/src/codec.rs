//! Tokio codec for CR-LF delimited protocol lines.
//!
//! Decoding splits the byte stream on LF with an optional preceding CR
//! and hands out lossy-UTF-8 strings. Lines longer than the protocol
//! cap are truncated at the cap and the excess up to the terminator is
//! discarded. Encoding appends CR-LF unconditionally.

use crate::{LINE_MAX, PAYLOAD_MAX};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Line framing with the 512-byte protocol cap.
#[derive(Debug)]
pub struct LineCodec {
    /// Read-buffer bound; once exceeded without a terminator the
    /// decoder truncates and discards to the next LF.
    max_buffer: usize,
    /// Inside an oversized line, skipping until the terminator.
    discarding: bool,
    /// Next index to scan for LF, so repeated decode calls stay linear.
    scanned: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            max_buffer: LINE_MAX,
            discarding: false,
            scanned: 0,
        }
    }

    fn extract(&mut self, src: &mut BytesMut, lf: usize) -> String {
        let mut line = src.split_to(lf + 1);
        self.scanned = 0;
        line.truncate(lf);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > PAYLOAD_MAX {
            line.truncate(PAYLOAD_MAX);
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let lf = src[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| i + self.scanned);

            if self.discarding {
                match lf {
                    Some(i) => {
                        src.advance(i + 1);
                        self.scanned = 0;
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        let len = src.len();
                        src.advance(len);
                        self.scanned = 0;
                        return Ok(None);
                    }
                }
            }

            return match lf {
                Some(i) if i > self.max_buffer => {
                    // Oversized line: keep the capped head, drop the rest.
                    let line = self.extract(src, self.max_buffer);
                    src.advance(i - self.max_buffer);
                    Ok(Some(line))
                }
                Some(i) => Ok(Some(self.extract(src, i))),
                None if src.len() > self.max_buffer => {
                    let line = self.extract(src, self.max_buffer);
                    self.discarding = true;
                    Ok(Some(line))
                }
                None => {
                    self.scanned = src.len();
                    Ok(None)
                }
            };
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        let payload = if item.len() > PAYLOAD_MAX {
            let mut cut = PAYLOAD_MAX;
            while !item.is_char_boundary(cut) {
                cut -= 1;
            }
            &item[..cut]
        } else {
            &item[..]
        };
        dst.reserve(payload.len() + 2);
        dst.put_slice(payload.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, bytes: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn splits_on_crlf_and_bare_lf() {
        let mut codec = LineCodec::new();
        let lines = decode_all(&mut codec, b"NICK alice\r\nUSER a 0 * :A\nPING x\r\n");
        assert_eq!(lines, vec!["NICK alice", "USER a 0 * :A", "PING x"]);
    }

    #[test]
    fn holds_partial_lines(){
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"JOIN #te"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_slice(b"st\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("JOIN #test"));
    }

    #[test]
    fn truncates_oversized_lines() {
        let mut codec = LineCodec::new();
        let mut input = vec![b'x'; 700];
        input.extend_from_slice(b"\r\nPING y\r\n");
        let lines = decode_all(&mut codec, &input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), PAYLOAD_MAX);
        assert_eq!(lines[1], "PING y");
    }

    #[test]
    fn encodes_with_crlf_and_cap() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("PING :x".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PING :x\r\n");

        let mut buf = BytesMut::new();
        codec.encode("y".repeat(600), &mut buf).unwrap();
        assert_eq!(buf.len(), LINE_MAX);
        assert_eq!(&buf[buf.len() - 2..], b"\r\n");
    }
}
