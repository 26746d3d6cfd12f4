//! The swarm engine: the top-level coordinator. Parses metainfo, owns the
//! piece store, starts the tracker poller and a bounded pool of
//! peer-session worker threads, and drives shutdown once every piece is
//! COMPLETE.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};

use crate::config::{EngineConfig, PEER_QUEUE_CAPACITY};
use crate::error::EngineError;
use crate::metainfo::Metainfo;
use crate::peer::session::Session;
use crate::piece_store::PieceStore;
use crate::tracker;
use crate::utils::generate_peer_id;

/// A brief poll of the shared receive loop, so workers notice shutdown or
/// completion promptly even while the peer-address queue is empty.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runs one end-to-end download to completion. The output file is named
/// after `metainfo.info.name` and created in the current working directory.
/// Returns once every piece has been verified and written, or an
/// `EngineError` on a fatal metainfo or output-I/O failure.
pub fn run(torrent_path: &Path, config: EngineConfig) -> Result<(), EngineError> {
    let metainfo = Metainfo::from_path(torrent_path)?;
    let info_hash = metainfo.info_hash();
    let peer_id = generate_peer_id();
    let output_path = Path::new(metainfo.name());

    log::info!(
        "starting download of {:?} ({} pieces, {} bytes)",
        metainfo.name(),
        metainfo.nr_pieces(),
        metainfo.length()
    );

    let store = Arc::new(PieceStore::initialize(
        output_path,
        metainfo.piece_length(),
        metainfo.piece_hashes(),
    )?);
    let metainfo = Arc::new(metainfo);
    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded::<SocketAddr>(PEER_QUEUE_CAPACITY);

    let tracker_handle = {
        let metainfo = Arc::clone(&metainfo);
        let shutdown = Arc::clone(&shutdown);
        let tracker_timeout = config.tracker_timeout;
        let port = config.port;
        thread::spawn(move || {
            tracker::http::run(&metainfo, info_hash, peer_id, port, tx, &shutdown, tracker_timeout)
        })
    };

    let mut workers = Vec::with_capacity(config.max_peers);
    for _ in 0..config.max_peers {
        let rx = rx.clone();
        let metainfo = Arc::clone(&metainfo);
        let store = Arc::clone(&store);
        let shutdown = Arc::clone(&shutdown);
        let config = config.clone();
        workers.push(thread::spawn(move || {
            worker_loop(rx, metainfo, store, info_hash, peer_id, &shutdown, &config)
        }));
    }
    drop(rx);

    // Poll for completion; cooperative shutdown signals every worker and
    // the tracker poller, letting each session's cleanup path run before
    // the thread exits.
    while !store.all_complete() {
        thread::sleep(WORKER_POLL_INTERVAL);
    }
    log::info!("all pieces complete, shutting down");
    shutdown.store(true, Ordering::Relaxed);

    for worker in workers {
        let _ = worker.join();
    }
    let _ = tracker_handle.join();

    Ok(())
}

/// One worker thread: pop a peer address, connect, handshake, and run the
/// full session loop; on any terminal outcome, move to the next address.
fn worker_loop(
    rx: crossbeam_channel::Receiver<SocketAddr>,
    metainfo: Arc<Metainfo>,
    store: Arc<PieceStore>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    shutdown: &AtomicBool,
    config: &EngineConfig,
) {
    while !shutdown.load(Ordering::Relaxed) && !store.all_complete() {
        let addr = match rx.recv_timeout(WORKER_POLL_INTERVAL) {
            Ok(addr) => addr,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        match Session::connect(
            addr,
            info_hash,
            peer_id,
            Arc::clone(&metainfo),
            Arc::clone(&store),
            config,
        ) {
            Ok(mut session) => {
                log::debug!("peer {addr} connected, entering message loop");
                session.run(shutdown);
            }
            Err(e) => {
                log::debug!("peer {addr} failed to connect/handshake: {e}");
            }
        }
    }
}
