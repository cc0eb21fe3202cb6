//! Archive stream format.
//!
//! An archive is a sequence of entries followed by a trailer:
//!
//! ```text
//! entry   := u32 LE header_len | bincode(ArchiveHeader) | body (header.size bytes)
//! trailer := u32 LE 0 | u64 LE entry_count | "SARC"
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ComposeError, Result};

/// Magic closing every sealed archive.
pub const TRAILER_MAGIC: &[u8; 4] = b"SARC";

/// Header of one archive entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveHeader {
    /// Entry name, relative to the data directory
    pub name: String,
    /// Body size in bytes (0 for directories)
    pub size: u64,
    /// Unix file mode
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch
    pub mtime: i64,
}

impl ArchiveHeader {
    /// Header for a regular file.
    pub fn file(name: impl Into<String>, size: u64, mode: u32, mtime: i64) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            mtime,
        }
    }

    /// Metadata-only header for a directory marker.
    pub fn directory(name: impl Into<String>, mode: u32, mtime: i64) -> Self {
        Self {
            name: name.into(),
            size: 0,
            mode,
            mtime,
        }
    }
}

/// Accumulates entries of one archive in memory until sealed.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    buf: BytesMut,
    entries: u64,
    body_remaining: u64,
}

impl ArchiveWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new entry. The previous entry's body must be complete.
    pub fn write_header(&mut self, header: &ArchiveHeader) -> Result<()> {
        if self.body_remaining != 0 {
            return Err(ComposeError::Pack {
                name: header.name.clone(),
                reason: format!(
                    "previous entry is missing {} body bytes",
                    self.body_remaining
                ),
            });
        }
        let encoded = bincode::serialize(header)?;
        self.buf.put_u32_le(encoded.len() as u32);
        self.buf.put_slice(&encoded);
        self.entries += 1;
        self.body_remaining = header.size;
        Ok(())
    }

    /// Append body bytes of the current entry.
    pub fn write_body(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.body_remaining {
            return Err(ComposeError::Pack {
                name: String::new(),
                reason: format!(
                    "body overflow: {} bytes written, {} expected",
                    data.len(),
                    self.body_remaining
                ),
            });
        }
        self.buf.put_slice(data);
        self.body_remaining -= data.len() as u64;
        Ok(())
    }

    /// Bytes accumulated so far, trailer excluded.
    pub fn size(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Number of entries written.
    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// True if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Append the trailer and return the sealed archive bytes.
    pub fn finish(mut self) -> Result<Bytes> {
        if self.body_remaining != 0 {
            return Err(ComposeError::Pack {
                name: String::new(),
                reason: format!("archive sealed with {} body bytes missing", self.body_remaining),
            });
        }
        self.buf.put_u32_le(0);
        self.buf.put_u64_le(self.entries);
        self.buf.put_slice(TRAILER_MAGIC);
        debug!(entries = self.entries, size = self.buf.len(), "Archive finished");
        Ok(self.buf.freeze())
    }
}

/// Decode a sealed archive into its entries.
pub fn decode_entries(mut data: Bytes) -> Result<Vec<(ArchiveHeader, Bytes)>> {
    let corrupt = |reason: &str| ComposeError::Serialization(format!("corrupt archive: {}", reason));
    let mut entries = Vec::new();
    loop {
        if data.remaining() < 4 {
            return Err(corrupt("truncated entry length"));
        }
        let header_len = data.get_u32_le() as usize;
        if header_len == 0 {
            break;
        }
        if data.remaining() < header_len {
            return Err(corrupt("truncated header"));
        }
        let header: ArchiveHeader = bincode::deserialize(&data.split_to(header_len))?;
        if (data.remaining() as u64) < header.size {
            return Err(corrupt("truncated body"));
        }
        let body = data.split_to(header.size as usize);
        entries.push((header, body));
    }
    if data.remaining() != 12 {
        return Err(corrupt("bad trailer length"));
    }
    let count = data.get_u64_le();
    if count != entries.len() as u64 {
        return Err(corrupt("entry count mismatch"));
    }
    if &data[..] != TRAILER_MAGIC {
        return Err(corrupt("bad trailer magic"));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_decoded_in_order() {
        let mut writer = ArchiveWriter::new();
        writer
            .write_header(&ArchiveHeader::directory("base/16384", 0o40700, 1_700_000_000))
            .unwrap();
        writer
            .write_header(&ArchiveHeader::file("base/16384/1259", 5, 0o600, 1_700_000_001))
            .unwrap();
        writer.write_body(b"hel").unwrap();
        writer.write_body(b"lo").unwrap();
        assert_eq!(writer.entry_count(), 2);

        let entries = decode_entries(writer.finish().unwrap()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.name, "base/16384");
        assert!(entries[0].1.is_empty());
        assert_eq!(entries[1].0.size, 5);
        assert_eq!(&entries[1].1[..], b"hello");
    }

    #[test]
    fn test_body_overflow_rejected() {
        let mut writer = ArchiveWriter::new();
        writer.write_header(&ArchiveHeader::file("f", 2, 0o600, 0)).unwrap();
        assert!(writer.write_body(b"abc").is_err());
    }

    #[test]
    fn test_header_before_body_complete_rejected() {
        let mut writer = ArchiveWriter::new();
        writer.write_header(&ArchiveHeader::file("f", 2, 0o600, 0)).unwrap();
        writer.write_body(b"a").unwrap();
        assert!(writer.write_header(&ArchiveHeader::file("g", 0, 0o600, 0)).is_err());
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_empty_archive_has_only_trailer() {
        let writer = ArchiveWriter::new();
        assert!(writer.is_empty());
        let sealed = writer.finish().unwrap();
        assert_eq!(sealed.len(), 16);
        assert!(decode_entries(sealed).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_archive_is_corrupt() {
        let mut writer = ArchiveWriter::new();
        writer.write_header(&ArchiveHeader::file("f", 4, 0o600, 0)).unwrap();
        writer.write_body(b"data").unwrap();
        let sealed = writer.finish().unwrap();
        let truncated = sealed.slice(..sealed.len() - 5);
        assert!(matches!(
            decode_entries(truncated),
            Err(ComposeError::Serialization(_))
        ));
    }
}
