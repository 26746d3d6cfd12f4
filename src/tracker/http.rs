//! HTTP tracker polling. GET-only announce; the response is a bencoded
//! dictionary decoded with `serde_bencode`.

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use url::Url;
use urlencoding::encode_binary;

use crate::metainfo::Metainfo;

/// First-three-rounds ramp-up interval, before the tracker's own `interval`
/// takes over.
const RAMP_UP_INTERVAL: Duration = Duration::from_secs(10);
const RAMP_UP_ROUNDS: u32 = 3;
/// Used when a round fails outright (network error, non-200, malformed
/// body) and there is no tracker-supplied interval to fall back on yet.
const FAILURE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    #[serde(default)]
    peers: CompactPeers,
}

#[derive(Debug, Default)]
struct CompactPeers(Vec<SocketAddr>);

impl<'de> Deserialize<'de> for CompactPeers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CompactPeersVisitor;

        impl<'de> Visitor<'de> for CompactPeersVisitor {
            type Value = CompactPeers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a compact (4-byte IP + 2-byte port) peer list")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                // Non-multiple-of-6 is not malformed enough to fail the
                // whole response: decode to an empty list.
                if v.len() % 6 != 0 {
                    return Ok(CompactPeers(Vec::new()));
                }
                let peers = v
                    .chunks_exact(6)
                    .map(|c| {
                        let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                        let port = u16::from_be_bytes([c[4], c[5]]);
                        SocketAddr::V4(SocketAddrV4::new(ip, port))
                    })
                    .collect();
                Ok(CompactPeers(peers))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_bytes(CompactPeersVisitor)
    }
}

struct AnnounceOutcome {
    interval: Option<Duration>,
    peers: Vec<SocketAddr>,
}

/// Builds the GET request line and performs one announce round-trip over a
/// blocking `TcpStream`. The connect and request/response are the only
/// suspension points here; this thread has nothing else to do while they
/// run.
fn announce(
    announce_url: &Url,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    timeout: Duration,
) -> io::Result<AnnounceOutcome> {
    let host = announce_url
        .host_str()
        .ok_or_else(|| invalid("announce URL has no host"))?;
    let tcp_port = announce_url.port().unwrap_or(80);
    let addr = (host, tcp_port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| invalid("announce host resolved to no address"))?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left=0&compact=1",
        encode_binary(&info_hash),
        encode_binary(&peer_id),
        port,
    );
    let path = if announce_url.query().is_some() {
        format!("{}&{}", announce_url.path(), query)
    } else {
        format!("{}?{}", announce_url.path(), query)
    };
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );

    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(request.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    let mut header_storage = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut header_storage);
    let body_offset = match response.parse(&raw) {
        Ok(httparse::Status::Complete(offset)) => offset,
        Ok(httparse::Status::Partial) => return Err(invalid("truncated tracker response")),
        Err(e) => return Err(invalid(&format!("malformed tracker response: {e}"))),
    };
    let status = response.code.unwrap_or(0);
    if status != 200 {
        return Err(invalid(&format!("tracker returned HTTP {status}")));
    }

    let body = &raw[body_offset..];
    let decoded: RawAnnounceResponse = serde_bencode::from_bytes(body)
        .map_err(|e| invalid(&format!("malformed tracker body: {e}")))?;
    if let Some(reason) = decoded.failure_reason {
        return Err(invalid(&format!("tracker failure: {reason}")));
    }

    Ok(AnnounceOutcome {
        interval: decoded.interval.filter(|i| *i > 0).map(|i| Duration::from_secs(i as u64)),
        peers: decoded.peers.0,
    })
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Drives the announce loop for the lifetime of the download: ramps up
/// with three 10 s rounds, then settles into the tracker's own interval.
/// New peer addresses are pushed to `tx` and recorded in the append-only
/// known-addresses set.
pub fn run(
    metainfo: &Metainfo,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    tx: Sender<SocketAddr>,
    shutdown: &AtomicBool,
    timeout: Duration,
) {
    let announce_url = match Url::parse(&metainfo.announce) {
        Ok(url) => url,
        Err(e) => {
            log::error!("tracker announce URL is invalid: {e}");
            return;
        }
    };

    let mut known = HashSet::new();
    let mut round = 0u32;

    while !shutdown.load(Ordering::Relaxed) {
        round += 1;
        let next_wait = match announce(&announce_url, info_hash, peer_id, port, timeout) {
            Ok(outcome) => {
                let mut new_peers = 0;
                for addr in outcome.peers {
                    if known.insert(addr) {
                        new_peers += 1;
                        if tx.send(addr).is_err() {
                            return;
                        }
                    }
                }
                log::debug!("tracker round {round}: {new_peers} new peer(s), {} known", known.len());
                outcome.interval
            }
            Err(e) => {
                log::warn!("tracker round {round} failed, treating as empty: {e}");
                None
            }
        };

        let wait = if round <= RAMP_UP_ROUNDS {
            RAMP_UP_INTERVAL
        } else {
            next_wait.unwrap_or(FAILURE_INTERVAL)
        };
        std::thread::sleep(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peers_decodes_multiple_of_six() {
        let raw = [127, 0, 0, 1, 0x1A, 0xE1, 127, 0, 0, 2, 0x1A, 0xE2];
        let decoded: CompactPeers =
            serde_bencode::from_bytes(&serde_bencode::to_bytes(&serde_bytes::Bytes::new(&raw)).unwrap())
                .unwrap();
        assert_eq!(decoded.0.len(), 2);
        assert_eq!(decoded.0[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(decoded.0[1], "127.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn compact_peers_non_multiple_of_six_is_empty() {
        let raw = [1, 2, 3, 4, 5];
        let decoded: CompactPeers =
            serde_bencode::from_bytes(&serde_bencode::to_bytes(&serde_bytes::Bytes::new(&raw)).unwrap())
                .unwrap();
        assert!(decoded.0.is_empty());
    }

    #[test]
    fn missing_peers_key_defaults_to_empty() {
        let body = b"d8:intervali1800ee";
        let decoded: RawAnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert!(decoded.peers.0.is_empty());
        assert_eq!(decoded.interval, Some(1800));
    }

    #[test]
    fn failure_reason_is_surfaced() {
        let body = b"d14:failure reason17:no such info_hashe";
        let decoded: RawAnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert_eq!(decoded.failure_reason.as_deref(), Some("no such info_hash"));
    }
}
