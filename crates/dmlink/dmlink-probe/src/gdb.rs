//! Remote-serial-protocol backend.
//!
//! Speaks the classic debugger-stub dialect: `$payload#checksum` framing
//! with `+`/`-` acknowledgements, `m addr,len` / `M addr,len:hex` memory
//! packets, run-length-encoded replies, and asynchronous stop replies
//! that may land in the middle of anything and must be drained rather
//! than trip the monitor.

use crate::error::ProbeError;
use crate::ProbeBackend;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Retransmits after a `-` (or garbage) before the transaction fails.
const RETRANSMIT_LIMIT: usize = 5;

/// Stop replies tolerated per transaction before we give up waiting for
/// the real answer.
const STOP_DRAIN_LIMIT: usize = 8;

/// Largest memory slice moved per packet. Conservative: every stub
/// advertising a packet size handles this, and the monitor's reads are
/// rarely bigger than a header anyway.
const CHUNK: usize = 1024;

/// Remote-serial-protocol probe over TCP.
pub struct GdbProbe {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: String,
    alive: bool,
}

impl GdbProbe {
    /// Connects to a remote stub.
    pub fn connect(host: &str, port: u16) -> Result<Self, ProbeError> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect(&peer).map_err(|source| ProbeError::Connect {
            addr: peer.clone(),
            source,
        })?;
        stream
            .set_read_timeout(Some(Duration::from_millis(1000)))
            .map_err(ProbeError::Io)?;
        stream.set_nodelay(true).ok();
        let writer = stream.try_clone().map_err(ProbeError::Io)?;
        debug!(%peer, "remote-serial stub connected");
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            peer,
            alive: true,
        })
    }

    fn read_byte(&mut self) -> Result<u8, ProbeError> {
        let mut b = [0u8; 1];
        self.reader.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Sends one packet and waits for its acknowledgement, retransmitting
    /// on `-`. A `$` seen while waiting is a packet the stub pushed at us
    /// (typically a stop reply); it is consumed, acked and ignored.
    fn send_packet(&mut self, payload: &str) -> Result<(), ProbeError> {
        let frame = frame_packet(payload);
        for attempt in 0..RETRANSMIT_LIMIT {
            self.writer.write_all(&frame)?;
            trace!(payload, attempt, "packet sent");
            loop {
                match self.read_byte()? {
                    b'+' => return Ok(()),
                    b'-' => {
                        warn!(payload, "stub rejected packet, retransmitting");
                        break;
                    }
                    b'$' => {
                        let stray = self.read_packet_body()?;
                        debug!(stray, "unsolicited packet while waiting for ack");
                    }
                    other => trace!(byte = other, "noise while waiting for ack"),
                }
            }
        }
        Err(ProbeError::RetriesExhausted("waiting for packet ack"))
    }

    /// Receives one packet, verifying the checksum and acking it. The
    /// returned payload is already run-length decoded.
    fn recv_packet(&mut self) -> Result<String, ProbeError> {
        for _ in 0..RETRANSMIT_LIMIT {
            // Hunt for the start-of-packet marker, skipping line noise
            // and stray acks.
            loop {
                if self.read_byte()? == b'$' {
                    break;
                }
            }
            match self.read_packet_body() {
                Ok(payload) => return Ok(payload),
                Err(ProbeError::Protocol(msg)) => {
                    warn!(%msg, "bad packet, requesting retransmit");
                    self.writer.write_all(b"-")?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ProbeError::RetriesExhausted("receiving a packet"))
    }

    /// Reads payload + checksum after the `$`, acks on success.
    fn read_packet_body(&mut self) -> Result<String, ProbeError> {
        let mut raw = Vec::new();
        loop {
            match self.read_byte()? {
                b'#' => break,
                b => raw.push(b),
            }
        }
        let mut cs = [0u8; 2];
        cs[0] = self.read_byte()?;
        cs[1] = self.read_byte()?;
        let want = u8::from_str_radix(
            std::str::from_utf8(&cs).map_err(|_| ProbeError::Protocol("bad checksum".into()))?,
            16,
        )
        .map_err(|_| ProbeError::Protocol("bad checksum".into()))?;
        let got = checksum(&raw);
        if want != got {
            return Err(ProbeError::Protocol(format!(
                "checksum mismatch (want {want:02x}, got {got:02x})"
            )));
        }
        self.writer.write_all(b"+")?;

        let decoded = rle_decode(&raw)?;
        String::from_utf8(decoded)
            .map_err(|_| ProbeError::Protocol("non-ASCII packet payload".into()))
    }

    /// One command round-trip, draining asynchronous stop replies that
    /// arrive in place of the answer.
    fn transact(&mut self, cmd: &str) -> Result<String, ProbeError> {
        self.send_packet(cmd)?;
        for _ in 0..STOP_DRAIN_LIMIT {
            let reply = self.recv_packet()?;
            if is_stop_reply(&reply) {
                debug!(reply, "drained stop reply");
                continue;
            }
            return Ok(reply);
        }
        Err(ProbeError::RetriesExhausted("draining stop replies"))
    }
}

impl ProbeBackend for GdbProbe {
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, ProbeError> {
        let mut out = Vec::with_capacity(len);
        let mut at = addr;
        while out.len() < len {
            let want = CHUNK.min(len - out.len());
            let reply = self.transact(&format!("m{at:x},{want:x}"))?;
            if let Some(err) = error_reply(&reply) {
                return Err(ProbeError::Target(err));
            }
            let bytes = hex::decode(reply.as_bytes())
                .map_err(|_| ProbeError::Protocol("memory reply is not hex".into()))?;
            if bytes.is_empty() || bytes.len() > want {
                return Err(ProbeError::Protocol(format!(
                    "memory reply returned {} of {want} bytes",
                    bytes.len()
                )));
            }
            at += bytes.len() as u64;
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), ProbeError> {
        let mut at = addr;
        for chunk in data.chunks(CHUNK) {
            let reply = self.transact(&format!(
                "M{at:x},{:x}:{}",
                chunk.len(),
                hex::encode(chunk)
            ))?;
            if let Some(err) = error_reply(&reply) {
                return Err(ProbeError::Target(err));
            }
            if reply != "OK" {
                return Err(ProbeError::Protocol(format!(
                    "unexpected write reply: {reply}"
                )));
            }
            at += chunk.len() as u64;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ProbeError> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        // Best-effort detach; the stub may simply drop the connection.
        let _ = self.writer.write_all(&frame_packet("D"));
        let _ = self.writer.shutdown(std::net::Shutdown::Both);
        debug!(peer = %self.peer, "remote-serial stub disconnected");
        Ok(())
    }
}

/// `$payload#cs` framing.
fn frame_packet(payload: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(b'$');
    frame.extend_from_slice(payload.as_bytes());
    frame.push(b'#');
    frame.extend_from_slice(format!("{:02x}", checksum(payload.as_bytes())).as_bytes());
    frame
}

/// Modulo-256 sum of the payload bytes.
fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Expands `c*N` runs: the repeat character encodes `N - 29` additional
/// copies of `c`. `}`-escaped bytes are unescaped as well.
fn rle_decode(raw: &[u8]) -> Result<Vec<u8>, ProbeError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'*' => {
                let (&prev, &count) = match (out.last(), raw.get(i + 1)) {
                    (Some(p), Some(c)) => (p, c),
                    _ => return Err(ProbeError::Protocol("dangling run-length marker".into())),
                };
                let repeats = count
                    .checked_sub(29)
                    .ok_or_else(|| ProbeError::Protocol("bad run-length count".into()))?;
                out.extend(std::iter::repeat_n(prev, repeats as usize));
                i += 2;
            }
            b'}' => {
                let esc = raw
                    .get(i + 1)
                    .ok_or_else(|| ProbeError::Protocol("dangling escape".into()))?;
                out.push(esc ^ 0x20);
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Stop replies and console output packets the stub may emit on its own.
fn is_stop_reply(payload: &str) -> bool {
    matches!(
        payload.as_bytes().first(),
        Some(b'S' | b'T' | b'W' | b'X' | b'O')
    ) && payload != "OK"
}

/// `E nn` / `Enn` error replies.
fn error_reply(payload: &str) -> Option<String> {
    let rest = payload.strip_prefix('E')?;
    let rest = rest.trim_start();
    if rest.len() == 2 && rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(format!("E{rest}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn checksum_matches_known_frames() {
        // "m200,4" per the framing rules.
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(frame_packet("OK"), b"$OK#9a".to_vec());
    }

    #[test]
    fn rle_decode_expands_runs() {
        // '0' followed by '*' and ' ' (32): three extra zeros, four total.
        assert_eq!(rle_decode(b"0* ").unwrap(), b"0000".to_vec());
        assert_eq!(rle_decode(b"ab*!c").unwrap(), b"abbbbbc".to_vec());
        assert!(rle_decode(b"*!").is_err());
        assert!(rle_decode(b"a*").is_err());
    }

    #[test]
    fn stop_replies_are_recognized() {
        assert!(is_stop_reply("T05thread:01;"));
        assert!(is_stop_reply("S05"));
        assert!(is_stop_reply("W00"));
        assert!(is_stop_reply("Ohello"));
        assert!(!is_stop_reply("OK"));
        assert!(!is_stop_reply("deadbeef"));
        assert!(!is_stop_reply("E03"));
    }

    /// Canned stub: accepts one connection and plays a scripted exchange.
    fn stub<F>(script: F) -> (std::net::SocketAddr, thread::JoinHandle<()>)
    where
        F: FnOnce(&mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            script(&mut s);
        });
        (addr, handle)
    }

    fn read_until_hash(s: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut b = [0u8; 1];
        loop {
            s.read_exact(&mut b).unwrap();
            buf.push(b[0]);
            if b[0] == b'#' {
                // checksum digits
                let mut cs = [0u8; 2];
                s.read_exact(&mut cs).unwrap();
                buf.extend_from_slice(&cs);
                return buf;
            }
        }
    }

    fn connect_to(addr: std::net::SocketAddr) -> GdbProbe {
        GdbProbe::connect(&addr.ip().to_string(), addr.port()).unwrap()
    }

    #[test]
    fn read_memory_round_trip() {
        let (addr, server) = stub(|s| {
            let req = read_until_hash(s);
            assert!(req.starts_with(b"$m1000,4#"));
            s.write_all(b"+").unwrap();
            s.write_all(&frame_packet("4f4c4d44")).unwrap();
            let mut ack = [0u8; 1];
            s.read_exact(&mut ack).unwrap();
            assert_eq!(&ack, b"+");
        });

        let mut probe = connect_to(addr);
        let bytes = probe.read_memory(0x1000, 4).unwrap();
        assert_eq!(bytes, vec![0x4f, 0x4c, 0x4d, 0x44]);
        server.join().unwrap();
    }

    #[test]
    fn stray_stop_reply_is_drained() {
        let (addr, server) = stub(|s| {
            let _req = read_until_hash(s);
            s.write_all(b"+").unwrap();
            // Asynchronous stop reply lands first; the real answer only
            // after the client acks it.
            s.write_all(&frame_packet("T05thread:01;")).unwrap();
            let mut ack = [0u8; 1];
            s.read_exact(&mut ack).unwrap();
            assert_eq!(&ack, b"+");
            s.write_all(&frame_packet("deadbeef")).unwrap();
            let mut ack2 = [0u8; 1];
            s.read_exact(&mut ack2).unwrap();
        });

        let mut probe = connect_to(addr);
        let bytes = probe.read_memory(0x2000, 4).unwrap();
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        server.join().unwrap();
    }

    #[test]
    fn bad_checksum_triggers_retransmit_request() {
        let (addr, server) = stub(|s| {
            let _req = read_until_hash(s);
            s.write_all(b"+").unwrap();
            // Corrupt frame first, correct one after the nak.
            s.write_all(b"$cafe#00").unwrap();
            let mut nak = [0u8; 1];
            s.read_exact(&mut nak).unwrap();
            assert_eq!(&nak, b"-");
            s.write_all(&frame_packet("cafe")).unwrap();
            let mut ack = [0u8; 1];
            s.read_exact(&mut ack).unwrap();
        });

        let mut probe = connect_to(addr);
        let bytes = probe.read_memory(0x0, 2).unwrap();
        assert_eq!(bytes, vec![0xca, 0xfe]);
        server.join().unwrap();
    }

    #[test]
    fn write_memory_sends_hex_payload() {
        let (addr, server) = stub(|s| {
            let req = read_until_hash(s);
            let text = String::from_utf8(req).unwrap();
            assert!(text.starts_with("$M20,3:0a0b0c#"));
            s.write_all(b"+").unwrap();
            s.write_all(&frame_packet("OK")).unwrap();
            let mut ack = [0u8; 1];
            s.read_exact(&mut ack).unwrap();
        });

        let mut probe = connect_to(addr);
        probe.write_memory(0x20, &[0x0a, 0x0b, 0x0c]).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn error_reply_surfaces_as_target_error() {
        let (addr, server) = stub(|s| {
            let _req = read_until_hash(s);
            s.write_all(b"+").unwrap();
            s.write_all(&frame_packet("E03")).unwrap();
            let mut ack = [0u8; 1];
            s.read_exact(&mut ack).unwrap();
        });

        let mut probe = connect_to(addr);
        let err = probe.read_memory(0x0, 4).unwrap_err();
        assert!(matches!(err, ProbeError::Target(_)));
        assert!(err.is_transient());
        server.join().unwrap();
    }
}
