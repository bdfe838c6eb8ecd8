use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::*;

/// RFC 4253 limit on a single binary packet.
const MAX_PACKET_LEN: u32 = 35000;

/// Client algorithm-set fingerprint taken from the first KEXINIT, before the
/// handshake proper consumes it. The hash is MD5 for parity with deployed
/// HASSH tooling; it identifies client stacks, nothing more.
#[derive(Clone, Debug)]
pub struct HasshInfo {
    pub hash: String,
    pub algorithms: String,
    pub client_id: String,
    pub kex_algorithms: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub compression_algs: Vec<String>,
    pub remote_addr: SocketAddr,
}

fn parse_name_list(data: &[u8], offset: usize) -> Option<(Vec<String>, usize)> {
    let len_bytes = data.get(offset..offset + 4)?;
    #[allow(clippy::unwrap_used)]
    let length = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    let offset = offset + 4;

    let raw = data.get(offset..offset + length)?;
    let offset = offset + length;

    if raw.is_empty() {
        return Some((Vec::new(), offset));
    }
    let text = std::str::from_utf8(raw).ok()?;
    Some((text.split(',').map(str::to_owned).collect(), offset))
}

/// Extracts the four client-to-server algorithm lists from an SSH_MSG_KEXINIT
/// payload (RFC 4253 §7.1): kex, encryption c2s, mac c2s, compression c2s.
/// The server-to-client and language lists are skipped over in order.
fn parse_kexinit(payload: &[u8]) -> Option<(Vec<String>, Vec<String>, Vec<String>, Vec<String>)> {
    if payload.len() < 17 || payload[0] != 20 {
        return None;
    }

    // message type byte plus the 16-byte cookie
    let offset = 17;

    let (kex, offset) = parse_name_list(payload, offset)?;
    let (_host_keys, offset) = parse_name_list(payload, offset)?;
    let (ciphers, offset) = parse_name_list(payload, offset)?;
    let (_ciphers_s2c, offset) = parse_name_list(payload, offset)?;
    let (macs, offset) = parse_name_list(payload, offset)?;
    let (_macs_s2c, offset) = parse_name_list(payload, offset)?;
    let (compression, _offset) = parse_name_list(payload, offset)?;

    Some((kex, ciphers, macs, compression))
}

fn hassh_algorithms(
    kex: &[String],
    ciphers: &[String],
    macs: &[String],
    compression: &[String],
) -> String {
    format!(
        "{};{};{};{}",
        kex.join(","),
        ciphers.join(","),
        macs.join(","),
        compression.join(",")
    )
}

enum CaptureState {
    AwaitingVersion,
    AwaitingKexInit { client_id: String },
    Done,
}

/// Passthrough wrapper over the accepted connection. Bytes flow through
/// unmodified; a copy accumulates until the first client KEXINIT is located
/// and fingerprinted, after which the wrapper is pure passthrough. Malformed
/// framing silently ends the capture without disturbing the connection.
pub struct HasshStream<S> {
    inner: S,
    remote_addr: SocketAddr,
    on_capture: Option<Box<dyn FnOnce(HasshInfo) + Send>>,
    buffer: Vec<u8>,
    state: CaptureState,
}

impl<S> HasshStream<S> {
    pub fn new(
        inner: S,
        remote_addr: SocketAddr,
        on_capture: impl FnOnce(HasshInfo) + Send + 'static,
    ) -> Self {
        Self {
            inner,
            remote_addr,
            on_capture: Some(Box::new(on_capture)),
            buffer: Vec::new(),
            state: CaptureState::AwaitingVersion,
        }
    }

    fn feed(&mut self, data: &[u8]) {
        if matches!(self.state, CaptureState::Done) {
            return;
        }
        self.buffer.extend_from_slice(data);
        self.advance();
    }

    fn give_up(&mut self) {
        self.state = CaptureState::Done;
        self.buffer = Vec::new();
        self.on_capture = None;
    }

    fn advance(&mut self) {
        if let CaptureState::AwaitingVersion = self.state {
            let Some(start) = find(&self.buffer, b"SSH-") else {
                return;
            };
            let Some(end) = find(&self.buffer[start..], b"\r\n") else {
                return;
            };
            let client_id = String::from_utf8_lossy(&self.buffer[start..start + end]).into_owned();
            self.buffer.drain(..start + end + 2);
            self.state = CaptureState::AwaitingKexInit { client_id };
        }

        let CaptureState::AwaitingKexInit { client_id } = &self.state else {
            return;
        };

        if self.buffer.len() < 5 {
            return;
        }
        #[allow(clippy::unwrap_used)]
        let packet_len = u32::from_be_bytes(self.buffer[..4].try_into().unwrap());
        if packet_len < 1 || packet_len > MAX_PACKET_LEN {
            return self.give_up();
        }
        if self.buffer.len() < 4 + packet_len as usize {
            return;
        }

        let padding_len = self.buffer[4] as usize;
        let Some(payload_len) = (packet_len as usize).checked_sub(padding_len + 1) else {
            return self.give_up();
        };
        if payload_len == 0 || 5 + payload_len > self.buffer.len() {
            return self.give_up();
        }
        let payload = &self.buffer[5..5 + payload_len];

        let Some((kex, ciphers, macs, compression)) = parse_kexinit(payload) else {
            return self.give_up();
        };

        let algorithms = hassh_algorithms(&kex, &ciphers, &macs, &compression);
        let info = HasshInfo {
            hash: format!("{:x}", md5::compute(algorithms.as_bytes())),
            algorithms,
            client_id: client_id.clone(),
            kex_algorithms: kex,
            ciphers,
            macs,
            compression_algs: compression,
            remote_addr: self.remote_addr,
        };

        debug!(hash = %info.hash, client = %info.client_id, "captured client fingerprint");
        if let Some(on_capture) = self.on_capture.take() {
            on_capture(info);
        }
        self.give_up();
    }
}

impl<S> std::fmt::Debug for HasshStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HasshStream({})", self.remote_addr)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl<S: AsyncRead + Unpin> AsyncRead for HasshStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let ret = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = ret {
            let filled = buf.filled();
            if filled.len() > before {
                let new_bytes = filled[before..].to_vec();
                this.feed(&new_bytes);
            }
        }
        ret
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HasshStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn name_list(names: &str) -> Vec<u8> {
        let mut out = (names.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(names.as_bytes());
        out
    }

    fn kexinit_packet(kex: &str, enc: &str, mac: &str, comp: &str) -> Vec<u8> {
        let mut payload = vec![20u8];
        payload.extend_from_slice(&[0u8; 16]); // cookie
        for names in [
            kex, "ssh-ed25519", enc, enc, mac, mac, comp, comp, "", "",
        ] {
            payload.extend_from_slice(&name_list(names));
        }
        payload.push(0); // first_kex_packet_follows
        payload.extend_from_slice(&[0u8; 4]); // reserved

        let padding_len = 4u8;
        let packet_len = (payload.len() + 1 + padding_len as usize) as u32;
        let mut packet = packet_len.to_be_bytes().to_vec();
        packet.push(padding_len);
        packet.extend_from_slice(&payload);
        packet.extend_from_slice(&vec![0u8; padding_len as usize]);
        packet
    }

    fn capture(chunks: &[&[u8]]) -> Option<HasshInfo> {
        let addr: SocketAddr = "203.0.113.9:50000".parse().unwrap();
        let (tx, rx) = mpsc::channel();
        let mut stream = HasshStream::new(tokio::io::empty(), addr, move |info| {
            tx.send(info).unwrap();
        });
        for chunk in chunks {
            stream.feed(chunk);
        }
        rx.try_recv().ok()
    }

    fn session_bytes() -> Vec<u8> {
        let mut bytes = b"SSH-2.0-OpenSSH_9.6\r\n".to_vec();
        bytes.extend(kexinit_packet(
            "curve25519-sha256",
            "aes128-ctr",
            "hmac-sha2-256",
            "none",
        ));
        bytes
    }

    #[test]
    fn captures_client_id_and_algorithms() {
        let info = capture(&[&session_bytes()]).unwrap();
        assert_eq!(info.client_id, "SSH-2.0-OpenSSH_9.6");
        assert_eq!(info.kex_algorithms, vec!["curve25519-sha256"]);
        assert_eq!(info.ciphers, vec!["aes128-ctr"]);
        assert_eq!(info.macs, vec!["hmac-sha2-256"]);
        assert_eq!(info.compression_algs, vec!["none"]);
        assert_eq!(
            info.algorithms,
            "curve25519-sha256;aes128-ctr;hmac-sha2-256;none"
        );
        assert_eq!(
            info.hash,
            format!(
                "{:x}",
                md5::compute(b"curve25519-sha256;aes128-ctr;hmac-sha2-256;none")
            )
        );
        assert_eq!(info.hash.len(), 32);
    }

    #[test]
    fn deterministic_and_order_sensitive() {
        let first = capture(&[&session_bytes()]).unwrap();
        let second = capture(&[&session_bytes()]).unwrap();
        assert_eq!(first.hash, second.hash);

        let mut swapped = b"SSH-2.0-OpenSSH_9.6\r\n".to_vec();
        swapped.extend(kexinit_packet(
            "curve25519-sha256",
            "aes128-ctr",
            "none",
            "hmac-sha2-256",
        ));
        let third = capture(&[&swapped]).unwrap();
        assert_ne!(first.hash, third.hash);
    }

    #[test]
    fn captures_across_fragmented_reads() {
        let bytes = session_bytes();
        let chunks: Vec<&[u8]> = bytes.chunks(3).collect();
        let info = capture(&chunks).unwrap();
        assert_eq!(info.client_id, "SSH-2.0-OpenSSH_9.6");
    }

    #[test]
    fn malformed_framing_aborts_silently() {
        let mut bytes = b"SSH-2.0-client\r\n".to_vec();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.push(0);
        assert!(capture(&[&bytes]).is_none());

        // non-KEXINIT first packet
        let mut bytes = b"SSH-2.0-client\r\n".to_vec();
        bytes.extend_from_slice(&8u32.to_be_bytes());
        bytes.push(2);
        bytes.extend_from_slice(&[99, 0, 0, 0, 0, 0, 0]);
        assert!(capture(&[&bytes]).is_none());
    }

    #[test]
    fn waits_for_complete_packet() {
        let bytes = session_bytes();
        let (head, tail) = bytes.split_at(30);
        let addr: SocketAddr = "203.0.113.9:50000".parse().unwrap();
        let (tx, rx) = mpsc::channel();
        let mut stream = HasshStream::new(tokio::io::empty(), addr, move |info| {
            tx.send(info).unwrap();
        });
        stream.feed(head);
        assert!(rx.try_recv().is_err());
        stream.feed(tail);
        assert!(rx.try_recv().is_ok());
    }
}
