//! Transport: UDP for probe/ack/indirect-ping/gossip, TCP for
//! push/pull and user-message streams. Optional symmetric AEAD envelope
//! on top of both.
use crate::error::{MemberError, MemberResult};
use crate::keyring::Keyring;
use crate::messages::PacketType;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_UDP_BUFFER_SIZE: usize = 1400;

/// Encodes `body` (already-MessagePack-encoded) behind the 1-byte type tag
/// and, if `keyring` holds a key, the AEAD envelope: outer byte
/// `Encrypt`, then `{version, nonce, ciphertext}` where the ciphertext
/// decrypts to `[real_type_tag][body]` and AAD is `real_type_tag || version`.
pub fn encode_envelope(tag: PacketType, body: &[u8], keyring: Option<&Keyring>) -> MemberResult<Vec<u8>> {
    match keyring {
        None => {
            let mut out = Vec::with_capacity(1 + body.len());
            out.push(tag as u8);
            out.extend_from_slice(body);
            Ok(out)
        }
        Some(kr) if kr.is_empty() => {
            let mut out = Vec::with_capacity(1 + body.len());
            out.push(tag as u8);
            out.extend_from_slice(body);
            Ok(out)
        }
        Some(kr) => {
            let mut inner = Vec::with_capacity(1 + body.len());
            inner.push(tag as u8);
            inner.extend_from_slice(body);
            // version is decided by which cipher the primary key selects (0 = 128-bit, 1 = 256-bit);
            // Keyring::encrypt builds the matching AAD itself so the two can never disagree.
            let (version, nonce, ciphertext) = kr.encrypt(&inner, tag as u8)?;
            let mut out = Vec::with_capacity(2 + nonce.len() + ciphertext.len());
            out.push(PacketType::Encrypt as u8);
            out.push(version);
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
    }
}

/// Returns `(real_type_tag, decoded_body)`.
pub fn decode_envelope(raw: &[u8], keyring: Option<&Keyring>) -> MemberResult<(u8, Vec<u8>)> {
    if raw.is_empty() {
        return Err(MemberError::Decode(rmp_serde::decode::Error::Syntax(
            "empty packet".into(),
        )));
    }
    let outer_tag = raw[0];
    if outer_tag == PacketType::Encrypt as u8 {
        let kr = keyring.ok_or(MemberError::Crypto)?;
        if raw.len() < 2 + 12 {
            return Err(MemberError::Crypto);
        }
        let version = raw[1];
        let nonce = &raw[2..14];
        let ciphertext = &raw[14..];
        // The AAD is `real_tag || version`, but the real tag is exactly what
        // decryption is about to reveal. The tag space is tiny, so just try
        // every candidate until one authenticates.
        for candidate in 0u8..14 {
            let aad = [candidate, version];
            if let Ok(plain) = kr.decrypt(nonce, ciphertext, &aad) {
                if plain.is_empty() {
                    continue;
                }
                return Ok((plain[0], plain[1..].to_vec()));
            }
        }
        Err(MemberError::Crypto)
    } else {
        Ok((outer_tag, raw[1..].to_vec()))
    }
}

/// A received UDP packet: source address, real type tag, decoded body.
pub type PacketEvent = (SocketAddr, u8, Vec<u8>);
/// An accepted TCP stream: source address, the stream itself.
pub type StreamEvent = (SocketAddr, TcpStream);

/// Best-effort UDP + reliable TCP transport. Cloning shares the
/// underlying sockets; only one `Transport` should own the receive ends of
/// the channels (returned separately from `bind`).
#[derive(Clone)]
pub struct Transport {
    udp: Arc<UdpSocket>,
    tcp_listener: Arc<TcpListener>,
    keyring: Option<Keyring>,
    buf_size: usize,
}

impl Transport {
    pub async fn bind(
        addr: SocketAddr,
        keyring: Option<Keyring>,
        buf_size: usize,
    ) -> MemberResult<(Self, mpsc::Receiver<PacketEvent>, mpsc::Receiver<StreamEvent>)> {
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        let tcp_listener = Arc::new(TcpListener::bind(addr).await?);

        let (packet_tx, packet_rx) = mpsc::channel(1024);
        let (stream_tx, stream_rx) = mpsc::channel(256);

        let this = Self {
            udp: udp.clone(),
            tcp_listener: tcp_listener.clone(),
            keyring,
            buf_size,
        };

        {
            let udp = udp.clone();
            let keyring = this.keyring.clone();
            let buf_size = this.buf_size;
            tokio::spawn(async move {
                let mut buf = vec![0u8; buf_size.max(DEFAULT_UDP_BUFFER_SIZE)];
                loop {
                    match udp.recv_from(&mut buf).await {
                        Ok((n, src)) => match decode_envelope(&buf[..n], keyring.as_ref()) {
                            Ok((tag, body)) => {
                                if packet_tx.send((src, tag, body)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(?src, error = %e, "dropping undecodable packet"),
                        },
                        Err(e) => {
                            // UDP send/receive errors are logged and ignored.
                            warn!(error = %e, "udp recv error");
                        }
                    }
                }
            });
        }

        {
            let listener = tcp_listener.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, src)) => {
                            if stream_tx.send((src, stream)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "tcp accept error"),
                    }
                }
            });
        }

        Ok((this, packet_rx, stream_rx))
    }

    /// Best-effort, unreliable send. Errors are logged, never
    /// propagated.
    pub async fn send_packet(&self, addr: SocketAddr, tag: PacketType, body: &[u8]) {
        match encode_envelope(tag, body, self.keyring.as_ref()) {
            Ok(framed) => {
                if let Err(e) = self.udp.send_to(&framed, addr).await {
                    warn!(%addr, error = %e, "udp send error");
                }
            }
            Err(e) => warn!(%addr, error = %e, "failed to encode outgoing packet"),
        }
    }

    /// Opens a reliable bidirectional stream for push/pull and
    /// user messages. Errors propagate; the caller decides whether to retry
    /// via another peer.
    pub async fn open_stream(&self, addr: SocketAddr) -> MemberResult<TcpStream> {
        Ok(TcpStream::connect(addr).await?)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn keyring(&self) -> Option<&Keyring> {
        self.keyring.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_envelope_roundtrips() {
        let body = rmp_serde::to_vec(&"hello").unwrap();
        let framed = encode_envelope(PacketType::Ping, &body, None).unwrap();
        let (tag, decoded) = decode_envelope(&framed, None).unwrap();
        assert_eq!(tag, PacketType::Ping as u8);
        assert_eq!(decoded, body);
    }

    #[test]
    fn encrypted_envelope_roundtrips() {
        let kr = Keyring::new(vec![vec![9u8; 32]]).unwrap();
        let body = rmp_serde::to_vec(&42u32).unwrap();
        let framed = encode_envelope(PacketType::Alive, &body, Some(&kr)).unwrap();
        assert_eq!(framed[0], PacketType::Encrypt as u8);
        let (tag, decoded) = decode_envelope(&framed, Some(&kr)).unwrap();
        assert_eq!(tag, PacketType::Alive as u8);
        assert_eq!(decoded, body);
    }
}
