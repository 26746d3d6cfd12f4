//! Parsing of the `.torrent` metainfo document. Single-file torrents only.

use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::error::EngineError;

/// The `info` sub-dictionary of a single-file torrent.
#[derive(Debug, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub length: i64,
    pub pieces: ByteBuf,
}

/// The parsed metainfo document.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
}

impl Metainfo {
    /// Reads and parses a `.torrent` file from disk.
    pub fn from_path(path: &std::path::Path) -> Result<Self, EngineError> {
        let bytes = std::fs::read(path).map_err(|source| EngineError::ReadTorrentFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    /// Parses a metainfo document from its raw bencoded bytes, validating
    /// the invariants `info` must hold.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        let metainfo: Metainfo = serde_bencode::from_bytes(bytes)
            .map_err(|e| EngineError::MalformedMetainfo(e.to_string()))?;
        metainfo.validate()?;
        Ok(metainfo)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.info.length <= 0 {
            return Err(EngineError::MalformedMetainfo(
                "info.length must be positive".into(),
            ));
        }
        if self.info.piece_length <= 0 {
            return Err(EngineError::MalformedMetainfo(
                "info.piece length must be positive".into(),
            ));
        }
        if self.info.pieces.len() % 20 != 0 {
            return Err(EngineError::MalformedMetainfo(format!(
                "info.pieces length {} is not a multiple of 20",
                self.info.pieces.len()
            )));
        }
        let nr_pieces = self.nr_pieces();
        if self.info.pieces.len() != nr_pieces * 20 {
            return Err(EngineError::MalformedMetainfo(format!(
                "info.pieces has {} hashes, expected {} for length {} at piece length {}",
                self.info.pieces.len() / 20,
                nr_pieces,
                self.info.length,
                self.info.piece_length
            )));
        }
        Ok(())
    }

    /// The 20-byte SHA-1 of the on-wire bencoded `info` sub-document.
    /// Recomputed from the parsed struct; this round-trips cleanly because
    /// `serde_bencode`'s dictionary-key ordering is canonical for the
    /// fields this client serializes.
    pub fn info_hash(&self) -> [u8; 20] {
        let encoded = serde_bencode::to_bytes(&RawInfo {
            name: &self.info.name,
            piece_length: self.info.piece_length,
            length: self.info.length,
            pieces: self.info.pieces.clone(),
        })
        .expect("Info always serializes");
        let digest = Sha1::digest(&encoded);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn length(&self) -> u64 {
        self.info.length as u64
    }

    pub fn piece_length(&self) -> u32 {
        self.info.piece_length as u32
    }

    pub fn nr_pieces(&self) -> usize {
        let len = self.info.length as u64;
        let piece_len = self.info.piece_length as u64;
        ((len + piece_len - 1) / piece_len) as usize
    }

    /// The length of piece `index`, accounting for a shorter last piece.
    pub fn piece_len(&self, index: usize) -> u32 {
        let nr_pieces = self.nr_pieces();
        if index + 1 < nr_pieces {
            self.piece_length()
        } else {
            let full = self.piece_length() as u64 * (nr_pieces - 1) as u64;
            (self.length() - full) as u32
        }
    }

    /// The expected 20-byte SHA-1 digests, one per piece, in index order.
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }
}

/// Mirrors `Info` but owns the exact field set/order serialized onto the
/// wire, kept separate from `Info` so adding client-only fields to `Info`
/// later can't accidentally change the info_hash.
#[derive(Debug, serde::Serialize)]
struct RawInfo<'a> {
    name: &'a str,
    #[serde(rename = "piece length")]
    piece_length: i64,
    length: i64,
    pieces: ByteBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes(length: i64, piece_length: i64, nr_pieces: usize) -> Vec<u8> {
        let pieces = vec![0xABu8; nr_pieces * 20];
        let announce = "http://tracker:6969";
        let doc = format!(
            "d8:announce{}:{}4:infod6:lengthi{}e12:piece lengthi{}e4:name4:test6:pieces{}:",
            announce.len(),
            announce,
            length,
            piece_length,
            pieces.len(),
        );
        let mut out = doc.into_bytes();
        out.extend_from_slice(&pieces);
        out.extend_from_slice(b"ee");
        out
    }

    #[test]
    fn parses_exact_multiple() {
        let bytes = sample_bytes(32768, 32768, 1);
        let m = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(m.nr_pieces(), 1);
        assert_eq!(m.piece_len(0), 32768);
        assert_eq!(m.name(), "test");
        assert_eq!(m.announce, "http://tracker:6969");
    }

    #[test]
    fn last_piece_is_short_when_not_exact_multiple() {
        let bytes = sample_bytes(32769, 32768, 2);
        let m = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(m.nr_pieces(), 2);
        assert_eq!(m.piece_len(0), 32768);
        assert_eq!(m.piece_len(1), 1);
    }

    #[test]
    fn rejects_wrong_piece_hash_count() {
        // claims 2 pieces worth of hashes but length implies only 1.
        let bytes = sample_bytes(100, 32768, 2);
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }

    #[test]
    fn info_hash_is_stable_for_same_input() {
        let bytes = sample_bytes(32768, 32768, 1);
        let m = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(m.info_hash(), m.info_hash());
    }
}
