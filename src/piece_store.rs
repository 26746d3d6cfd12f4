//! Owns the output file and the per-piece state array. This is the
//! synchronization point shared by every peer session: a single mutex
//! around the in-memory state array is sufficient since the critical
//! sections are small.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use sha1::{Digest, Sha1};

use crate::error::EngineError;
use crate::bitfield::BitField;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    Missing,
    Pending,
    Complete,
}

pub struct PieceStore {
    file: File,
    piece_length: u32,
    hashes: Vec<[u8; 20]>,
    state: Mutex<Vec<PieceState>>,
    completed: AtomicUsize,
    progress_interval: usize,
}

impl PieceStore {
    /// Creates the output file if absent and sets every piece to MISSING.
    pub fn initialize(path: &Path, piece_length: u32, hashes: Vec<[u8; 20]>) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(EngineError::OutputIo)?;
        let nr_pieces = hashes.len();
        let progress_interval = ((nr_pieces + 99) / 100).max(1);
        Ok(Self {
            file,
            piece_length,
            hashes,
            state: Mutex::new(vec![PieceState::Missing; nr_pieces]),
            completed: AtomicUsize::new(0),
            progress_interval,
        })
    }

    pub fn nr_pieces(&self) -> usize {
        self.hashes.len()
    }

    /// Lowest-index piece the peer has that is still MISSING; not
    /// rarest-first. Mutually exclusive with every other
    /// acquire/release/commit call.
    pub fn acquire(&self, peer_bitfield: &BitField) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        for (i, s) in state.iter_mut().enumerate() {
            if *s == PieceState::Missing && peer_bitfield.has(i) {
                *s = PieceState::Pending;
                return Some(i);
            }
        }
        None
    }

    /// Unconditionally returns a piece to MISSING.
    pub fn release(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        state[index] = PieceState::Missing;
    }

    /// Verifies, writes, and commits a piece, or releases it back to
    /// MISSING on a hash mismatch. `Err` means the output file itself is
    /// unusable and is fatal to the engine.
    pub fn commit(&self, index: usize, bytes: &[u8]) -> Result<bool, EngineError> {
        let expected = self.hashes[index];
        let digest = Sha1::digest(bytes);
        if digest.as_slice() != expected {
            self.release(index);
            return Ok(false);
        }

        let offset = index as u64 * self.piece_length as u64;
        self.file
            .write_at(bytes, offset)
            .map_err(EngineError::OutputIo)?;
        self.file.sync_data().map_err(EngineError::OutputIo)?;

        {
            let mut state = self.state.lock().unwrap();
            state[index] = PieceState::Complete;
        }

        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.log_progress(done);
        Ok(true)
    }

    fn log_progress(&self, done: usize) {
        if done % self.progress_interval == 0 || done == self.nr_pieces() {
            let pct = done * 100 / self.nr_pieces();
            log::info!("progress: {pct}% ({done}/{})", self.nr_pieces());
        }
    }

    pub fn all_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst) == self.nr_pieces()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(bytes: &[u8]) -> [u8; 20] {
        let digest = Sha1::digest(bytes);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    #[test]
    fn acquire_picks_lowest_index_peer_has() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PieceStore::initialize(&dir.path().join("out"), 10, vec![[0u8; 20]; 3]).unwrap();
        let mut bf = BitField::empty(3);
        bf.set(1);
        bf.set(2);
        assert_eq!(store.acquire(&bf), Some(1));
        // piece 1 is now PENDING, so the same peer's next acquire skips it.
        assert_eq!(store.acquire(&bf), Some(2));
        assert_eq!(store.acquire(&bf), None);
    }

    #[test]
    fn acquire_returns_none_when_peer_has_nothing_we_need() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PieceStore::initialize(&dir.path().join("out"), 10, vec![[0u8; 20]; 3]).unwrap();
        let bf = BitField::empty(3);
        assert_eq!(store.acquire(&bf), None);
    }

    #[test]
    fn release_makes_a_pending_piece_available_again() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PieceStore::initialize(&dir.path().join("out"), 10, vec![[0u8; 20]; 1]).unwrap();
        let mut bf = BitField::empty(1);
        bf.set(0);
        assert_eq!(store.acquire(&bf), Some(0));
        assert_eq!(store.acquire(&bf), None);
        store.release(0);
        assert_eq!(store.acquire(&bf), Some(0));
    }

    #[test]
    fn commit_writes_bytes_and_marks_complete_on_matching_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let data = vec![0x42u8; 16];
        let store = PieceStore::initialize(&path, 16, vec![hash_of(&data)]).unwrap();
        assert!(store.commit(0, &data).unwrap());
        assert!(store.all_complete());
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[..16], data.as_slice());
    }

    #[test]
    fn commit_reverts_to_missing_on_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PieceStore::initialize(&dir.path().join("out"), 16, vec![[0xFFu8; 20]]).unwrap();
        let mut bf = BitField::empty(1);
        bf.set(0);
        assert_eq!(store.acquire(&bf), Some(0));
        let corrupted = vec![0x00u8; 16];
        assert!(!store.commit(0, &corrupted).unwrap());
        assert!(!store.all_complete());
        // piece is MISSING again and can be re-acquired.
        assert_eq!(store.acquire(&bf), Some(0));
    }

    #[test]
    fn all_complete_requires_every_piece() {
        let dir = tempfile::tempdir().unwrap();
        let data0 = vec![0u8; 4];
        let data1 = vec![1u8; 4];
        let store = PieceStore::initialize(
            &dir.path().join("out"),
            4,
            vec![hash_of(&data0), hash_of(&data1)],
        )
        .unwrap();
        assert!(store.commit(0, &data0).unwrap());
        assert!(!store.all_complete());
        assert!(store.commit(1, &data1).unwrap());
        assert!(store.all_complete());
    }

    #[test]
    fn writes_last_piece_at_correct_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let piece0 = vec![0xAAu8; 16];
        let piece1 = vec![0xBBu8; 4];
        let store = PieceStore::initialize(&path, 16, vec![hash_of(&piece0), hash_of(&piece1)])
            .unwrap();
        store.commit(0, &piece0).unwrap();
        store.commit(1, &piece1).unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[0..16], piece0.as_slice());
        assert_eq!(&on_disk[16..20], piece1.as_slice());
    }
}
