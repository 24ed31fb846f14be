//! NZB fixtures and test content generators

use super::server::ServerScript;

/// Group every fixture is posted to
pub const TEST_GROUP: &str = "alt.binaries.test";

/// One `<file>` entry of a generated NZB
pub struct NzbFileSpec {
    /// Filename placed in quotes in the subject
    pub filename: String,
    /// (message id, declared bytes) per segment
    pub segments: Vec<(String, u64)>,
}

/// Generate an NZB from file specs
pub fn create_nzb(title: &str, files: &[NzbFileSpec]) -> String {
    let mut files_xml = String::new();
    for file in files {
        let mut segments_xml = String::new();
        for (i, (message_id, size)) in file.segments.iter().enumerate() {
            segments_xml.push_str(&format!(
                "      <segment bytes=\"{}\" number=\"{}\">{}</segment>\n",
                size,
                i + 1,
                message_id
            ));
        }
        files_xml.push_str(&format!(
            r#"  <file poster="test@example.com" date="1234567890" subject="&quot;{}&quot; yEnc (1/{})">
    <groups>
      <group>{}</group>
    </groups>
    <segments>
{}    </segments>
  </file>
"#,
            file.filename,
            file.segments.len(),
            TEST_GROUP,
            segments_xml
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="title">{}</meta>
  </head>
{}</nzb>"#,
        title, files_xml
    )
}

/// Generate yEnc-encoded test content
///
/// Note: This is a simplified single-part yEnc encoding for testing purposes.
pub fn generate_yenc_content(data: &[u8], filename: &str) -> Vec<u8> {
    let mut result = Vec::new();

    let header = format!("=ybegin line=128 size={} name={}\r\n", data.len(), filename);
    result.extend_from_slice(header.as_bytes());

    for &byte in data {
        let encoded = byte.wrapping_add(42);
        match encoded {
            0x00 | 0x0A | 0x0D | 0x3D => {
                result.push(b'=');
                result.push(encoded.wrapping_add(64));
            }
            _ => result.push(encoded),
        }
    }

    let footer = format!("\r\n=yend size={}\r\n", data.len());
    result.extend_from_slice(footer.as_bytes());

    result
}

/// Deterministic pseudo-random payload
pub fn test_payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i >> 8) as u8))
        .collect()
}

/// A file cut into segments, each posted as its own yEnc article
pub struct PostedFile {
    /// Filename
    pub name: String,
    /// Complete payload
    pub data: Vec<u8>,
    /// Message ids in segment order
    pub ids: Vec<String>,
    /// Decoded payload chunk of each segment
    pub chunks: Vec<Vec<u8>>,
}

impl PostedFile {
    /// Split `data` into `segment_size` chunks with ids `<prefix>-<n>@test`
    pub fn new(name: &str, data: Vec<u8>, segment_size: usize) -> Self {
        let prefix: String = name.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        let chunks: Vec<Vec<u8>> = data.chunks(segment_size).map(<[u8]>::to_vec).collect();
        let ids = (1..=chunks.len()).map(|n| format!("{}-{}@test", prefix, n)).collect();
        Self {
            name: name.to_string(),
            data,
            ids,
            chunks,
        }
    }

    /// NZB entry for this file
    pub fn spec(&self) -> NzbFileSpec {
        NzbFileSpec {
            filename: self.name.clone(),
            segments: self
                .ids
                .iter()
                .zip(&self.chunks)
                .map(|(id, chunk)| (id.clone(), chunk.len() as u64))
                .collect(),
        }
    }

    /// Put every segment on the server except the indices in `missing`
    pub fn post(&self, script: &mut ServerScript, missing: &[usize]) {
        for (index, (id, chunk)) in self.ids.iter().zip(&self.chunks).enumerate() {
            if !missing.contains(&index) {
                script
                    .articles
                    .insert(id.clone(), generate_yenc_content(chunk, &self.name));
            }
        }
    }
}
