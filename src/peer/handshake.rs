//! The fixed 68-byte BitTorrent handshake:
//! `<1:pstrlen=19><19:"BitTorrent protocol"><8:reserved=0><20:info_hash><20:peer_id>`.

use std::io;

pub const LEN: usize = 68;
const PSTR: &str = "BitTorrent protocol";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Parses a handshake from exactly `LEN` bytes, read via the fixed-size
    /// path rather than the variable-length frame reader.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Handshake> {
        if bytes.len() != LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("handshake must be exactly {LEN} bytes, got {}", bytes.len()),
            ));
        }
        if bytes[0] as usize != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake pstrlen must be 19",
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }

    pub fn to_bytes(&self) -> [u8; LEN] {
        let mut out = [0u8; LEN];
        out[0] = PSTR.len() as u8;
        out[1..20].copy_from_slice(PSTR.as_bytes());
        // bytes 20..28 stay zero: reserved.
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    /// True iff the handshake carries our expected info_hash. The remote
    /// peer_id is not validated.
    pub fn matches_info_hash(&self, expected: &[u8; 20]) -> bool {
        &self.info_hash == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_info_hash_and_peer_id() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let hs = Handshake::new(info_hash, peer_id);
        let bytes = hs.to_bytes();
        assert_eq!(bytes.len(), LEN);
        let parsed = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.info_hash, info_hash);
        assert_eq!(parsed.peer_id, peer_id);
    }

    #[test]
    fn matches_info_hash_checks_only_the_hash() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.matches_info_hash(&[1u8; 20]));
        assert!(!hs.matches_info_hash(&[9u8; 20]));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Handshake::from_bytes(&[0u8; 67]).is_err());
    }

    #[test]
    fn rejects_wrong_pstrlen() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).to_bytes();
        bytes[0] = 18;
        assert!(Handshake::from_bytes(&bytes).is_err());
    }
}
