//! `vutor`, a download-only BitTorrent client: contact a tracker, negotiate
//! the peer wire protocol with many peers concurrently, and write a
//! hash-verified single file to disk.

pub mod bitfield;
pub mod config;
pub mod engine;
pub mod error;
pub mod metainfo;
pub mod piece_store;
pub mod utils;

pub mod peer {
    pub mod handshake;
    pub mod message;
    pub mod session;
}

pub mod tracker {
    pub mod http;
}
