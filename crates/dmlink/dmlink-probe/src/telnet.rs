//! Command-console backend.
//!
//! Drives debug servers that expose a line-oriented telnet console with
//! word-granular memory commands: `mdw <addr> <count>` dumps 32-bit
//! words, `mww <addr> <value>` patches one. Byte-granular requests are
//! widened to the covering word window; sub-word writes read-modify-write
//! the boundary words.
//!
//! Dump output is parsed leniently: banners, echoed commands and blank
//! lines are skipped; only `0xADDR: W W W ...` lines count. Words are
//! interpreted little-endian, matching the targets this link runs on.
//! The full 64-bit address is printed into commands; servers for 32-bit
//! targets simply see the low words (they reject anything wider
//! themselves).

use crate::error::ProbeError;
use crate::ProbeBackend;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, trace};

/// Console prompt marking the end of a response.
const PROMPT: &str = "> ";

/// Telnet-console probe over TCP.
pub struct TelnetProbe {
    stream: TcpStream,
    peer: String,
    alive: bool,
}

impl TelnetProbe {
    /// Connects and swallows the greeting banner up to the first prompt.
    pub fn connect(host: &str, port: u16) -> Result<Self, ProbeError> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect(&peer).map_err(|source| ProbeError::Connect {
            addr: peer.clone(),
            source,
        })?;
        stream
            .set_read_timeout(Some(Duration::from_millis(1000)))
            .map_err(ProbeError::Io)?;
        let mut probe = Self { stream, peer, alive: true };
        let banner = probe.read_until_prompt()?;
        debug!(peer = %probe.peer, banner = banner.trim(), "console connected");
        Ok(probe)
    }

    /// Sends one command line and collects everything up to the next
    /// prompt.
    fn command(&mut self, line: &str) -> Result<String, ProbeError> {
        trace!(line, "console command");
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        let reply = self.read_until_prompt()?;
        let lowered = reply.to_ascii_lowercase();
        if lowered.contains("error") || lowered.contains("invalid") {
            return Err(ProbeError::Target(reply.trim().to_string()));
        }
        Ok(reply)
    }

    fn read_until_prompt(&mut self) -> Result<String, ProbeError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte)?;
            buf.push(byte[0]);
            if buf.ends_with(PROMPT.as_bytes()) {
                let text = String::from_utf8_lossy(&buf[..buf.len() - PROMPT.len()]);
                return Ok(text.into_owned());
            }
        }
    }

    /// Reads the aligned word window covering `[addr, addr + len)`.
    fn read_words(&mut self, start: u64, count: usize) -> Result<Vec<u8>, ProbeError> {
        let reply = self.command(&format!("mdw {start:#x} {count}"))?;
        let words = parse_word_dump(&reply)?;

        let mut bytes = Vec::with_capacity(count * 4);
        for i in 0..count {
            let word_addr = start + (i as u64) * 4;
            let word = words.get(&word_addr).ok_or_else(|| {
                ProbeError::Protocol(format!("dump is missing word at {word_addr:#x}"))
            })?;
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        Ok(bytes)
    }
}

impl ProbeBackend for TelnetProbe {
    fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, ProbeError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let start = addr & !3;
        let end = (addr + len as u64 + 3) & !3;
        let count = ((end - start) / 4) as usize;
        let window = self.read_words(start, count)?;
        let skip = (addr - start) as usize;
        Ok(window[skip..skip + len].to_vec())
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), ProbeError> {
        if data.is_empty() {
            return Ok(());
        }
        // Widen to the covering word window, patching the partial head
        // and tail words with their current contents.
        let start = addr & !3;
        let end = (addr + data.len() as u64 + 3) & !3;
        let count = ((end - start) / 4) as usize;

        let mut window = vec![0u8; count * 4];
        let head_partial = addr != start;
        let tail_partial = addr + data.len() as u64 != end;
        if head_partial {
            let w = self.read_words(start, 1)?;
            window[..4].copy_from_slice(&w);
        }
        if tail_partial && (count > 1 || !head_partial) {
            let w = self.read_words(end - 4, 1)?;
            window[(count - 1) * 4..].copy_from_slice(&w);
        }

        let off = (addr - start) as usize;
        window[off..off + data.len()].copy_from_slice(data);

        for i in 0..count {
            let word = u32::from_le_bytes(window[i * 4..i * 4 + 4].try_into().unwrap());
            let word_addr = start + (i as u64) * 4;
            self.command(&format!("mww {word_addr:#x} {word:#010x}"))?;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ProbeError> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        let _ = self.stream.write_all(b"exit\n");
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        debug!(peer = %self.peer, "console disconnected");
        Ok(())
    }
}

/// Extracts `addr -> word` pairs from `0xADDR: W W W ...` dump lines.
fn parse_word_dump(reply: &str) -> Result<BTreeMap<u64, u32>, ProbeError> {
    let mut words = BTreeMap::new();
    for line in reply.lines() {
        let line = line.trim();
        let Some((addr_part, rest)) = line.split_once(':') else {
            continue; // banner or echoed command
        };
        let Some(hex_addr) = addr_part.trim().strip_prefix("0x") else {
            continue;
        };
        let Ok(mut at) = u64::from_str_radix(hex_addr, 16) else {
            continue;
        };
        for tok in rest.split_whitespace() {
            let tok = tok.strip_prefix("0x").unwrap_or(tok);
            let word = u32::from_str_radix(tok, 16)
                .map_err(|_| ProbeError::Protocol(format!("bad word token: {tok}")))?;
            words.insert(at, word);
            at += 4;
        }
    }
    if words.is_empty() {
        return Err(ProbeError::Protocol("dump contained no words".into()));
    }
    Ok(words)
}
