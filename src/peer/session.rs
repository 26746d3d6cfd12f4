//! Per-connection peer session state machine.
//!
//! One OS thread drives one `Session`: connect, handshake, then the
//! choke-gated request/response loop. Mio multiplexes the single socket's
//! readable/writable interest within that thread.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::bitfield::BitField;
use crate::config::EngineConfig;
use crate::metainfo::Metainfo;
use crate::peer::handshake::{self, Handshake};
use crate::peer::message::Message;
use crate::piece_store::PieceStore;

const TOKEN: Token = Token(0);

fn blocks_per_piece(piece_len: u32, block_len: u32) -> u32 {
    (piece_len + block_len - 1) / block_len
}

fn io_timeout(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, what.to_string())
}

fn connection_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")
}

pub struct Session {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    addr: SocketAddr,
    metainfo: Arc<Metainfo>,
    block_len: u32,
    read_timeout: Duration,
    store: Arc<PieceStore>,

    peer_choking: bool,
    peer_bitfield: BitField,
    current_piece: Option<usize>,
    blocks_received: u32,
    buffer: Vec<u8>,
}

impl Session {
    /// Connects, handshakes, and returns an ACTIVE session, or an error if
    /// either step fails within `config.connect_timeout`.
    pub fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_peer_id: [u8; 20],
        metainfo: Arc<Metainfo>,
        store: Arc<PieceStore>,
        config: &EngineConfig,
    ) -> io::Result<Session> {
        let mut stream = TcpStream::connect(addr)?;
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(16);
        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)?;

        let deadline = Instant::now() + config.connect_timeout;
        wait_writable(&mut poll, &mut events, deadline)?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }

        let handshake = Handshake::new(info_hash, my_peer_id);
        write_all_until(&mut stream, &mut poll, &mut events, &handshake.to_bytes(), deadline)?;

        let mut reply = [0u8; handshake::LEN];
        read_exact_until(&mut stream, &mut poll, &mut events, &mut reply, deadline)?;
        let reply = Handshake::from_bytes(&reply)?;
        if !reply.matches_info_hash(&info_hash) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake info_hash mismatch",
            ));
        }

        let nr_pieces = metainfo.nr_pieces();
        Ok(Session {
            stream,
            poll,
            events,
            addr,
            block_len: config.block_len,
            read_timeout: config.read_timeout,
            metainfo,
            store,
            peer_choking: true,
            peer_bitfield: BitField::empty(nr_pieces),
            current_piece: None,
            blocks_received: 0,
            buffer: Vec::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Drives the ACTIVE message loop until the shared download completes,
    /// shutdown is requested, or the connection dies. Cleanup always runs
    /// before returning, releasing any in-flight piece assignment.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) && !self.store.all_complete() {
            if let Err(e) = self.step() {
                log::debug!("peer {} session ending: {}", self.addr, e);
                break;
            }
        }
        self.cleanup();
    }

    fn step(&mut self) -> io::Result<()> {
        let msg = self.read_message()?;
        self.dispatch(msg)?;
        self.maybe_request()
    }

    fn read_message(&mut self) -> io::Result<Message> {
        let mut len_buf = [0u8; 4];
        let deadline = Instant::now() + self.read_timeout;
        read_exact_until(&mut self.stream, &mut self.poll, &mut self.events, &mut len_buf, deadline)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut body = vec![0u8; len];
        read_exact_until(&mut self.stream, &mut self.poll, &mut self.events, &mut body, deadline)?;
        Message::deserialize(&body)
    }

    fn send(&mut self, msg: Message) -> io::Result<()> {
        let bytes = msg.serialize();
        let deadline = Instant::now() + self.read_timeout;
        write_all_until(&mut self.stream, &mut self.poll, &mut self.events, &bytes, deadline)
    }

    fn dispatch(&mut self, msg: Message) -> io::Result<()> {
        match msg {
            Message::KeepAlive
            | Message::Interested
            | Message::NotInterested
            | Message::Cancel(..)
            | Message::Request(..)
            | Message::Unknown(_) => {}
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Have(index) => self.peer_bitfield.set(index as usize),
            Message::Bitfield(bits) => {
                match BitField::from_message(&bits, self.metainfo.nr_pieces()) {
                    Some(bf) => self.peer_bitfield = bf,
                    None => log::warn!("peer {} sent a malformed bitfield, ignoring", self.addr),
                }
            }
            Message::Piece(index, begin, block) => self.on_piece(index as usize, begin, block)?,
        }
        Ok(())
    }

    /// Accepts a PIECE only if it matches the single outstanding request
    /// (`index == current_piece` and `begin == blocks_received * block_len`);
    /// anything else is silently dropped.
    fn on_piece(&mut self, index: usize, begin: u32, block: Vec<u8>) -> io::Result<()> {
        let Some(current) = self.current_piece else {
            return Ok(());
        };
        if index != current || begin != self.blocks_received * self.block_len {
            return Ok(());
        }

        self.buffer.extend_from_slice(&block);
        self.blocks_received += 1;

        let blocks_needed = blocks_per_piece(self.metainfo.piece_len(current), self.block_len);
        if self.blocks_received == blocks_needed {
            let bytes = std::mem::take(&mut self.buffer);
            if let Err(e) = self.store.commit(current, &bytes) {
                return Err(io::Error::other(e.to_string()));
            }
            self.current_piece = None;
            self.blocks_received = 0;
        }
        Ok(())
    }

    /// After dispatch: if choked, do nothing else this round. Otherwise
    /// acquire a piece if idle and issue the next sequential REQUEST, one
    /// outstanding request at a time.
    fn maybe_request(&mut self) -> io::Result<()> {
        if self.peer_choking {
            return Ok(());
        }
        if self.current_piece.is_none() {
            match self.store.acquire(&self.peer_bitfield) {
                Some(piece) => {
                    self.current_piece = Some(piece);
                    self.blocks_received = 0;
                    self.buffer.clear();
                }
                None => return Ok(()),
            }
        }
        let piece = self.current_piece.expect("just set or already present");
        let begin = self.blocks_received * self.block_len;
        self.send(Message::Request(piece as u32, begin, self.block_len))
    }

    /// Releases any held piece assignment back to MISSING unless it was
    /// just verified COMPLETE.
    fn cleanup(&mut self) {
        if let Some(piece) = self.current_piece.take() {
            self.store.release(piece);
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn remaining(deadline: Instant, what: &str) -> io::Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| io_timeout(what))
}

fn wait_writable(poll: &mut Poll, events: &mut Events, deadline: Instant) -> io::Result<()> {
    loop {
        let budget = remaining(deadline, "connect timed out")?;
        poll.poll(events, Some(budget))?;
        if events.iter().any(|e| e.token() == TOKEN && e.is_writable()) {
            return Ok(());
        }
    }
}

fn read_exact_until(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let budget = remaining(deadline, "read timed out")?;
        poll.poll(events, Some(budget))?;
        let mut readable = false;
        for event in events.iter() {
            if event.token() == TOKEN && event.is_readable() {
                readable = true;
            }
        }
        if !readable {
            continue;
        }
        loop {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(connection_closed()),
                Ok(n) => {
                    filled += n;
                    if filled == buf.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

fn write_all_until(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    buf: &[u8],
    deadline: Instant,
) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let budget = remaining(deadline, "write timed out")?;
        poll.poll(events, Some(budget))?;
        let mut writable = false;
        for event in events.iter() {
            if event.token() == TOKEN && event.is_writable() {
                writable = true;
            }
        }
        if !writable {
            continue;
        }
        loop {
            match stream.write(&buf[written..]) {
                Ok(0) => return Err(connection_closed()),
                Ok(n) => {
                    written += n;
                    if written == buf.len() {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::handshake::Handshake;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;

    fn test_metainfo(nr_pieces: usize, piece_length: u32) -> Metainfo {
        // Build a minimal single-file metainfo in-process rather than going
        // through bencode, since `Metainfo`'s fields are crate-visible.
        let length = piece_length as u64 * (nr_pieces as u64 - 1) + 4;
        let bytes = format!(
            "d8:announce4:none4:infod6:lengthi{}e12:piece lengthi{}e4:name4:test6:pieces{}:",
            length,
            piece_length,
            nr_pieces * 20,
        );
        let mut doc = bytes.into_bytes();
        doc.extend(std::iter::repeat(0xAB).take(nr_pieces * 20));
        doc.extend_from_slice(b"ee");
        Metainfo::from_bytes(&doc).unwrap()
    }

    #[test]
    fn connect_fails_on_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [1u8; 20];

        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; handshake::LEN];
            sock.read_exact(&mut buf).unwrap();
            let reply = Handshake::new([9u8; 20], [2u8; 20]);
            sock.write_all(&reply.to_bytes()).unwrap();
        });

        let metainfo = Arc::new(test_metainfo(1, 16384));
        let store = Arc::new(
            crate::piece_store::PieceStore::initialize(
                &std::env::temp_dir().join("vutor-test-mismatch"),
                16384,
                metainfo.piece_hashes(),
            )
            .unwrap(),
        );
        let config = EngineConfig::default();
        let result = Session::connect(addr, info_hash, [3u8; 20], metainfo, store, &config);
        assert!(result.is_err());
        handle.join().unwrap();
    }

    #[test]
    fn connect_succeeds_on_matching_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [5u8; 20];

        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; handshake::LEN];
            sock.read_exact(&mut buf).unwrap();
            let reply = Handshake::new([5u8; 20], [9u8; 20]);
            sock.write_all(&reply.to_bytes()).unwrap();
        });

        let metainfo = Arc::new(test_metainfo(1, 16384));
        let store = Arc::new(
            crate::piece_store::PieceStore::initialize(
                &std::env::temp_dir().join("vutor-test-match"),
                16384,
                metainfo.piece_hashes(),
            )
            .unwrap(),
        );
        let config = EngineConfig::default();
        let session = Session::connect(addr, info_hash, [3u8; 20], metainfo, store, &config);
        assert!(session.is_ok());
        handle.join().unwrap();
    }
}
