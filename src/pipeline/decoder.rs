//! Segment content decoding

/// Decoded segment payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSegment {
    /// Payload bytes; zero-filled when the segment could not be decoded
    pub data: Vec<u8>,
    /// Decoded cleanly and completely
    pub intact: bool,
}

impl DecodedSegment {
    /// Zero-filled stand-in for a segment that is missing or undecodable
    pub fn placeholder(size: u64) -> Self {
        Self {
            data: vec![0; usize::try_from(size).unwrap_or(0)],
            intact: false,
        }
    }
}

/// Turns a raw article body into payload bytes
///
/// Decoding never fails; trouble is reported through
/// [`DecodedSegment::intact`] with a zero-filled buffer in place of the data.
pub trait SegmentDecoder: Send + Sync {
    /// Decode `raw`; `declared_size` sizes the placeholder on failure
    fn decode(&self, raw: &[u8], declared_size: u64) -> DecodedSegment;
}

/// yEnc decoder backed by nntp-rs
#[derive(Clone, Copy, Debug, Default)]
pub struct YencDecoder;

impl SegmentDecoder for YencDecoder {
    fn decode(&self, raw: &[u8], declared_size: u64) -> DecodedSegment {
        match nntp_rs::yenc_decode(raw) {
            Ok(decoded) => {
                // =ypart offsets are 1-based and inclusive
                let expected = match decoded.part.as_ref() {
                    Some(part) => part.end.checked_sub(part.begin).map(|span| span + 1),
                    None => Some(decoded.header.size),
                };
                let complete = expected == Some(decoded.data.len() as u64);
                let checksum_ok = decoded.verify_crc32() != Some(false);
                if !complete {
                    tracing::debug!(
                        decoded = decoded.data.len(),
                        expected = ?expected,
                        "yEnc payload length differs from announced"
                    );
                } else if !checksum_ok {
                    tracing::debug!(
                        computed = format!("{:08x}", decoded.calculated_crc32),
                        "yEnc checksum mismatch"
                    );
                }
                DecodedSegment {
                    data: decoded.data,
                    intact: complete && checksum_ok,
                }
            }
            Err(e) => {
                tracing::debug!(error = ?e, bytes = raw.len(), "yEnc decode failed");
                DecodedSegment::placeholder(declared_size)
            }
        }
    }
}
