//! Error types for the parts of the crate whose failures are fatal to the
//! whole download, as opposed to peer- or tracker-scoped failures, which
//! are handled locally (see `peer::session` and `tracker::http`) and never
//! surface here.

use std::io;

/// Errors that abort the engine outright: malformed metainfo or an
/// unusable output file.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to read torrent file {path}: {source}")]
    ReadTorrentFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed metainfo: {0}")]
    MalformedMetainfo(String),

    #[error("output file I/O failure: {0}")]
    OutputIo(#[from] io::Error),
}
