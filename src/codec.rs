//! Change-buffer wire codec
//!
//! A change buffer is a self-describing byte blob: a 12-byte header followed
//! by the payload. Two shapes exist and share the header:
//!
//! ```text
//! ChangeHeader := payload_size:u64  kind:u32      // kind = "COPY" | "DIFF"
//! FullCopy     := ChangeHeader  bytes[payload_size]
//! SparseDiff   := ChangeHeader  { page_index:u32  bytes[page_size] }*
//! ```
//!
//! Integers are little-endian. No compression, no endianness normalization:
//! producer and consumer are assumed to share page size and byte order, and
//! the consumer must know the producer's page size to walk a sparse diff.

use crate::error::{ArenaError, Result};

/// Wire length of [`ChangeHeader`]
pub const CHANGE_HEADER_LEN: usize = 12;

/// Wire length of one sparse-diff entry
pub const fn diff_entry_len(page_size: usize) -> usize {
    4 + page_size
}

/// Change-buffer shape tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChangeKind {
    /// Verbatim byte image of the whole arena
    FullCopy = u32::from_le_bytes(*b"COPY"),
    /// One `{page_index, page bytes}` entry per dirty page
    SparseDiff = u32::from_le_bytes(*b"DIFF"),
}

impl ChangeKind {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            v if v == ChangeKind::FullCopy as u32 => Ok(ChangeKind::FullCopy),
            v if v == ChangeKind::SparseDiff as u32 => Ok(ChangeKind::SparseDiff),
            other => Err(ArenaError::InvalidKind(other)),
        }
    }
}

/// Parsed change-buffer header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeHeader {
    pub payload_size: u64,
    pub kind: ChangeKind,
}

impl ChangeHeader {
    pub fn new(kind: ChangeKind, payload_size: u64) -> Self {
        ChangeHeader { payload_size, kind }
    }

    pub fn to_bytes(&self) -> [u8; CHANGE_HEADER_LEN] {
        let mut bytes = [0u8; CHANGE_HEADER_LEN];
        bytes[0..8].copy_from_slice(&self.payload_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&(self.kind as u32).to_le_bytes());
        bytes
    }

    /// Parse and validate a header from the front of `buffer`.
    ///
    /// Rejects a truncated header, an unrecognized kind tag, and a payload
    /// length the buffer cannot hold, so callers touch no payload byte
    /// before the blob is known to be well-formed.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < CHANGE_HEADER_LEN {
            return Err(ArenaError::TruncatedBuffer {
                expected: CHANGE_HEADER_LEN,
                actual: buffer.len(),
            });
        }

        let payload_size = u64::from_le_bytes(buffer[0..8].try_into().unwrap());
        let kind = ChangeKind::from_u32(u32::from_le_bytes(buffer[8..12].try_into().unwrap()))?;

        let expected = CHANGE_HEADER_LEN + payload_size as usize;
        if buffer.len() < expected {
            return Err(ArenaError::TruncatedBuffer {
                expected,
                actual: buffer.len(),
            });
        }

        Ok(ChangeHeader { payload_size, kind })
    }

    /// The payload bytes following this header in `buffer`
    pub fn payload<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[CHANGE_HEADER_LEN..CHANGE_HEADER_LEN + self.payload_size as usize]
    }
}

/// Iterator over the `{page_index, page bytes}` entries of a sparse diff
pub struct DiffEntries<'a> {
    payload: &'a [u8],
    page_size: usize,
}

impl<'a> DiffEntries<'a> {
    /// Validate granularity and wrap the payload.
    ///
    /// Fails if the payload is not a whole number of entries; a valid
    /// iterator therefore never yields a short entry.
    pub fn new(payload: &'a [u8], page_size: usize) -> Result<Self> {
        let entry = diff_entry_len(page_size);
        if payload.len() % entry != 0 {
            return Err(ArenaError::MalformedDiff {
                payload: payload.len() as u64,
                entry,
            });
        }
        Ok(DiffEntries { payload, page_size })
    }

    /// Number of entries remaining
    pub fn len(&self) -> usize {
        self.payload.len() / diff_entry_len(self.page_size)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl<'a> Iterator for DiffEntries<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.payload.is_empty() {
            return None;
        }
        let (entry, rest) = self.payload.split_at(diff_entry_len(self.page_size));
        self.payload = rest;
        let index = u32::from_le_bytes(entry[0..4].try_into().unwrap());
        Some((index, &entry[4..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = ChangeHeader::new(ChangeKind::SparseDiff, 8200);
        let mut buffer = header.to_bytes().to_vec();
        buffer.resize(CHANGE_HEADER_LEN + 8200, 0);

        let parsed = ChangeHeader::from_bytes(&buffer).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.payload(&buffer).len(), 8200);
    }

    #[test]
    fn test_kind_tags_are_ascii() {
        assert_eq!((ChangeKind::FullCopy as u32).to_le_bytes(), *b"COPY");
        assert_eq!((ChangeKind::SparseDiff as u32).to_le_bytes(), *b"DIFF");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = ChangeHeader::new(ChangeKind::FullCopy, 0).to_bytes();
        bytes[8..12].copy_from_slice(b"JUNK");
        assert!(matches!(
            ChangeHeader::from_bytes(&bytes),
            Err(ArenaError::InvalidKind(_))
        ));
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(matches!(
            ChangeHeader::from_bytes(&[0u8; 5]),
            Err(ArenaError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = ChangeHeader::new(ChangeKind::FullCopy, 100).to_bytes();
        // Header claims 100 payload bytes, none follow
        assert!(matches!(
            ChangeHeader::from_bytes(&bytes),
            Err(ArenaError::TruncatedBuffer {
                expected: 112,
                actual: 12
            })
        ));
    }

    #[test]
    fn test_diff_entries_iteration() {
        let page_size = 4096;
        let mut payload = Vec::new();
        for index in [0u32, 2] {
            payload.extend_from_slice(&index.to_le_bytes());
            payload.extend_from_slice(&vec![index as u8; page_size]);
        }

        let entries = DiffEntries::new(&payload, page_size).unwrap();
        assert_eq!(entries.len(), 2);
        let collected: Vec<_> = entries.map(|(i, bytes)| (i, bytes[0])).collect();
        assert_eq!(collected, vec![(0, 0), (2, 2)]);
    }

    #[test]
    fn test_ragged_diff_payload_rejected() {
        let payload = vec![0u8; 4096]; // one entry short of its index prefix
        assert!(matches!(
            DiffEntries::new(&payload, 4096),
            Err(ArenaError::MalformedDiff { .. })
        ));
    }

    #[test]
    fn test_empty_diff_payload_is_valid() {
        let entries = DiffEntries::new(&[], 4096).unwrap();
        assert!(entries.is_empty());
        assert_eq!(entries.count(), 0);
    }
}
