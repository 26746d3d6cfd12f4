//! Small helpers that don't belong to any one component.

use rand::Rng;

/// Generates a 20-byte peer id of the form `"-VU0001-"` followed by 12 hex
/// characters derived from 6 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let prefix = b"-VU0001-";
    let mut random = [0u8; 6];
    rand::thread_rng().fill(&mut random);

    let mut id = [0u8; 20];
    id[..prefix.len()].copy_from_slice(prefix);
    let hex: String = random.iter().map(|b| format!("{b:02x}")).collect();
    id[prefix.len()..].copy_from_slice(&hex.as_bytes()[..20 - prefix.len()]);
    id
}
