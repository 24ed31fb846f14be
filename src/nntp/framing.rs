//! Response framing: status line, dot-terminated bodies, compressed bodies
//!
//! [`FrameDecoder`] is a push parser: feed it the connection buffer after
//! every read and it returns a [`Response`] once a whole frame is present,
//! draining exactly the bytes it consumed. It keeps enough state to resume
//! the terminator search where the previous call stopped, so a terminator
//! split across reads is still found.

use super::response::{Response, parse_status_line};
use crate::error::{Error, Result};
use flate2::{Decompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Body terminator preceded by the line ending of the last body line
const TERMINATOR: &[u8] = b"\r\n.\r\n";
/// Terminator of an empty body
const EMPTY_BODY: &[u8] = b".\r\n";

const READ_CHUNK: usize = 16 * 1024;

/// How the response to a command is framed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameMode {
    /// Status line only
    SingleLine,
    /// Status line, then a dot-stuffed body ending in a lone `.`
    MultiLine,
    /// Status line, then a deflate stream whose inflated form is a multi-line body
    Compressed,
}

impl FrameMode {
    /// Pick a mode from the two flags callers pass around
    pub fn from_flags(multiline: bool, compressed: bool) -> Self {
        match (multiline, compressed) {
            (_, true) => FrameMode::Compressed,
            (true, false) => FrameMode::MultiLine,
            (false, false) => FrameMode::SingleLine,
        }
    }

    /// Article replies fix their own framing: 220-222 carry a body, 223 does not
    fn settle(self, code: u16) -> Self {
        match (self, code) {
            (FrameMode::SingleLine, 220..=222) => FrameMode::MultiLine,
            (FrameMode::MultiLine, 223) => FrameMode::SingleLine,
            (mode, _) => mode,
        }
    }
}

/// Incremental decoder for one response
#[derive(Debug)]
pub struct FrameDecoder {
    mode: FrameMode,
    convert_newlines: bool,
    status: Option<(u16, String)>,
    body_start: usize,
    scanned: usize,
}

impl FrameDecoder {
    /// Decoder for a single response in `mode`
    pub fn new(mode: FrameMode, convert_newlines: bool) -> Self {
        Self {
            mode,
            convert_newlines,
            status: None,
            body_start: 0,
            scanned: 0,
        }
    }

    /// Try to complete the frame from `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. A status code above
    /// 399 fails with [`Error::Protocol`] before any body is considered.
    pub fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Response>> {
        if self.status.is_none() {
            let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };

            let line = &buf[..newline];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let text = String::from_utf8_lossy(line).into_owned();
            let parsed = parse_status_line(&text);
            let status_len = newline + 1;

            let (code, message) = match parsed {
                Ok(status) => status,
                Err(e) => {
                    buf.drain(..status_len);
                    return Err(e);
                }
            };

            if code > 399 {
                buf.drain(..status_len);
                return Err(Error::Protocol { code, message });
            }

            self.mode = self.mode.settle(code);
            if self.mode == FrameMode::SingleLine {
                buf.drain(..status_len);
                return Ok(Some(Response::new(code, message, Vec::new())));
            }

            self.status = Some((code, message));
            self.body_start = status_len;
            self.scanned = status_len;
        }

        let found = match self.mode {
            FrameMode::MultiLine => self.find_plain_body(buf),
            FrameMode::Compressed => match self.find_compressed_body(buf) {
                Ok(found) => found,
                Err(e) => {
                    // Nothing after an undecodable stream can be framed
                    buf.clear();
                    self.status = None;
                    return Err(e);
                }
            },
            FrameMode::SingleLine => None,
        };

        let Some((content, consumed)) = found else {
            return Ok(None);
        };

        buf.drain(..consumed);
        let (code, message) = self.status.take().unwrap_or_default();

        let mut body = unstuff(&content);
        if self.convert_newlines {
            body = crlf_to_lf(&body);
        }

        Ok(Some(Response::new(code, message, body)))
    }

    /// Locate the dot terminator; returns the raw body and bytes consumed
    fn find_plain_body(&mut self, buf: &[u8]) -> Option<(Vec<u8>, usize)> {
        let body = &buf[self.body_start..];

        if body.starts_with(EMPTY_BODY) {
            return Some((Vec::new(), self.body_start + EMPTY_BODY.len()));
        }

        // Back off so a terminator straddling two reads is seen whole
        let from = self
            .scanned
            .saturating_sub(TERMINATOR.len() - 1)
            .max(self.body_start);

        match find(&buf[from..], TERMINATOR) {
            Some(offset) => {
                let end = from + offset;
                Some((
                    buf[self.body_start..end].to_vec(),
                    end + TERMINATOR.len(),
                ))
            }
            None => {
                self.scanned = buf.len();
                None
            }
        }
    }

    /// Inflate what has arrived; done once the deflate stream reports its end
    fn find_compressed_body(&mut self, buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        let raw = &buf[self.body_start..];
        if raw.is_empty() {
            return Ok(None);
        }

        let inflated = inflate(raw)?;
        if !inflated.complete {
            return Ok(None);
        }

        let mut consumed = self.body_start + inflated.consumed;
        if buf[consumed..].starts_with(EMPTY_BODY) {
            consumed += EMPTY_BODY.len();
        }

        let data = inflated.data;
        let content = if data == EMPTY_BODY {
            Vec::new()
        } else if data.ends_with(TERMINATOR) {
            data[..data.len() - TERMINATOR.len()].to_vec()
        } else {
            data
        };

        Ok(Some((content, consumed)))
    }
}

struct Inflated {
    data: Vec<u8>,
    complete: bool,
    consumed: usize,
}

/// Inflate a zlib-wrapped or raw deflate stream as far as the input allows
///
/// Fails once the bytes are neither, since waiting for more cannot help.
fn inflate(raw: &[u8]) -> Result<Inflated> {
    inflate_with(raw, true)
        .or_else(|_| inflate_with(raw, false))
        .map_err(|e| Error::Parse(format!("corrupt compressed body: {}", e)))
}

fn inflate_with(raw: &[u8], zlib_header: bool) -> std::result::Result<Inflated, flate2::DecompressError> {
    let mut decompress = Decompress::new(zlib_header);
    let mut data = Vec::with_capacity(raw.len() * 4);

    loop {
        let in_before = decompress.total_in() as usize;
        let out_before = data.len();
        data.reserve(READ_CHUNK);

        match decompress.decompress_vec(&raw[in_before..], &mut data, FlushDecompress::None) {
            Ok(Status::StreamEnd) => {
                return Ok(Inflated {
                    data,
                    complete: true,
                    consumed: decompress.total_in() as usize,
                });
            }
            Ok(_) => {
                let progressed = decompress.total_in() as usize > in_before || data.len() > out_before;
                if !progressed {
                    return Ok(Inflated {
                        data,
                        complete: false,
                        consumed: in_before,
                    });
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Remove dot-stuffing: a line starting with `..` loses its first dot
pub fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut line_start = true;
    let mut i = 0;

    while i < body.len() {
        let byte = body[i];
        if line_start && byte == b'.' && body.get(i + 1) == Some(&b'.') {
            i += 1;
            line_start = false;
            continue;
        }
        out.push(byte);
        line_start = byte == b'\n';
        i += 1;
    }

    out
}

/// Apply dot-stuffing and append the terminator, producing wire bytes
pub fn encode_multiline(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let mut line_start = true;

    for &byte in body {
        if line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        line_start = byte == b'\n';
    }

    if body.is_empty() {
        out.extend_from_slice(EMPTY_BODY);
    } else {
        out.extend_from_slice(TERMINATOR);
    }
    out
}

fn crlf_to_lf(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(byte);
    }
    out
}

/// Connection-side read buffer that survives across responses
#[derive(Debug, Default)]
pub struct ResponseReader {
    buf: Vec<u8>,
}

impl ResponseReader {
    /// Empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Read until one full response in `mode` has arrived
    ///
    /// End of stream before the frame is complete is a transport error.
    pub async fn read_response<R>(
        &mut self,
        io: &mut R,
        mode: FrameMode,
        convert_newlines: bool,
    ) -> Result<Response>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut decoder = FrameDecoder::new(mode, convert_newlines);

        loop {
            if let Some(response) = decoder.decode(&mut self.buf)? {
                return Ok(response);
            }

            self.buf.reserve(READ_CHUNK);
            let read = io
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;

            if read == 0 {
                return Err(Error::Transport("connection closed by server".to_string()));
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;
    use tokio_test::io::Builder;

    fn decode_all(mode: FrameMode, chunks: &[&[u8]]) -> Result<Option<Response>> {
        let mut decoder = FrameDecoder::new(mode, false);
        let mut buf = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
            if let Some(response) = decoder.decode(&mut buf)? {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    #[test]
    fn single_line_ends_after_status() {
        let response = decode_all(FrameMode::SingleLine, &[b"211 2 2 5 php.doc.nl\r\n"])
            .unwrap()
            .unwrap();
        assert_eq!(response.code(), 211);
        assert_eq!(response.message(), "2 2 5 php.doc.nl");
        assert!(response.body().is_empty());
    }

    #[test]
    fn error_status_is_surfaced_without_body() {
        let err = decode_all(FrameMode::MultiLine, &[b"430 No such article\r\n"]).unwrap_err();
        match err {
            Error::Protocol { code, message } => {
                assert_eq!(code, 430);
                assert_eq!(message, "No such article");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn multiline_handles_split_terminator() {
        let response = decode_all(
            FrameMode::MultiLine,
            &[b"222 0 <a@b> body\r\nfirst\r", b"\nsecond\r\n.", b"\r", b"\n"],
        )
        .unwrap()
        .unwrap();
        assert_eq!(response.body(), b"first\r\nsecond");
        assert_eq!(response.lines(), &["first", "second"]);
    }

    #[test]
    fn multiline_empty_body() {
        let response = decode_all(FrameMode::MultiLine, &[b"224 overview\r\n", b".\r\n"])
            .unwrap()
            .unwrap();
        assert!(response.body().is_empty());
    }

    #[test]
    fn multiline_waits_for_terminator() {
        assert!(
            decode_all(FrameMode::MultiLine, &[b"222 body\r\nline\r\n.."])
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn leftover_bytes_stay_buffered() {
        let mut decoder = FrameDecoder::new(FrameMode::MultiLine, false);
        let mut buf = b"222 body\r\nx\r\n.\r\n205 bye\r\n".to_vec();
        let response = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(response.body(), b"x");
        assert_eq!(buf, b"205 bye\r\n");
    }

    #[test]
    fn dot_stuffing_round_trip() {
        let original: &[u8] = b".hidden\r\nplain\r\n..double\r\n.\r\nend";
        let mut wire = b"222 0 <x@y> body\r\n".to_vec();
        wire.extend_from_slice(&encode_multiline(original));

        let response = decode_all(FrameMode::MultiLine, &[&wire]).unwrap().unwrap();
        assert_eq!(response.body(), original);
    }

    #[test]
    fn unstuff_removes_one_dot_per_line() {
        assert_eq!(unstuff(b"..a\r\n...b\r\nc..d"), b".a\r\n..b\r\nc..d");
    }

    #[test]
    fn convert_newlines_collapses_crlf() {
        let mut decoder = FrameDecoder::new(FrameMode::MultiLine, true);
        let mut buf = b"215 list\r\na\r\nb\r\n.\r\n".to_vec();
        let response = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(response.body(), b"a\nb");
    }

    #[test]
    fn compressed_body_is_inflated() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"1\tsubject\r\n2\tother\r\n.\r\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut wire = b"224 compressed overview\r\n".to_vec();
        wire.extend_from_slice(&compressed);
        let (head, tail) = wire.split_at(wire.len() - 3);

        let response = decode_all(FrameMode::Compressed, &[head, tail])
            .unwrap()
            .unwrap();
        assert_eq!(response.lines(), &["1\tsubject", "2\tother"]);
    }

    #[test]
    fn corrupt_compressed_body_fails_without_waiting() {
        let mut decoder = FrameDecoder::new(FrameMode::Compressed, false);
        let mut buf = b"224 compressed overview\r\nnot deflate at all".to_vec();

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {:?}", err);
        assert!(buf.is_empty());
    }

    #[test]
    fn article_status_decides_framing() {
        let mut buf = b"222 0 <late@x>\r\nbody\r\n.\r\n223 5 <next@x>\r\n".to_vec();

        let mut single = FrameDecoder::new(FrameMode::SingleLine, false);
        let late = single.decode(&mut buf).unwrap().unwrap();
        assert_eq!(late.body(), b"body");

        let mut multi = FrameDecoder::new(FrameMode::MultiLine, false);
        let next = multi.decode(&mut buf).unwrap().unwrap();
        assert_eq!(next.code(), 223);
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_status_line_is_parse_error() {
        assert!(matches!(
            decode_all(FrameMode::SingleLine, &[b"garbage\r\n"]),
            Err(Error::Parse(_))
        ));
    }

    #[tokio::test]
    async fn reader_reassembles_chunked_stream() {
        let mut io = Builder::new()
            .read(b"222 0 <id@x> bo")
            .read(b"dy\r\n..dot\r\n")
            .read(b".\r\n")
            .build();

        let mut reader = ResponseReader::new();
        let response = reader
            .read_response(&mut io, FrameMode::MultiLine, false)
            .await
            .unwrap();
        assert_eq!(response.code(), 222);
        assert_eq!(response.body(), b".dot");
    }

    #[tokio::test]
    async fn reader_reports_eof_as_transport_error() {
        let mut io = Builder::new().read(b"222 body\r\npartial").build();
        let mut reader = ResponseReader::new();
        let err = reader
            .read_response(&mut io, FrameMode::MultiLine, false)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
