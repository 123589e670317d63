//! Access to the process and socket tables.
//!
//! Connection ownership is resolved by reading `/proc/net/tcp` and
//! `/proc/net/tcp6` to map a local port to a socket inode, then scanning
//! `/proc/<pid>/fd` for a `socket:[<inode>]` link.
//!
//! All reads go through [`ProcFs`] so tests can supply table contents
//! without touching the real `/proc`.
//!
//! # Table Format
//!
//! ```text
//!    sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
//!    0: 0100007F:8AE1 0100007F:22B8 01 00000000:00000000 00:00000000 00000000   100        0 12345 ...
//! ```
//!
//! IPv4 addresses are 8 hex chars in host byte order; IPv6 addresses are
//! 32 hex chars stored as four host-order 32-bit words. Ports are big-endian
//! hex. State `01` is ESTABLISHED.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// TCP state code for an established connection.
pub const TCP_ESTABLISHED: u8 = 0x01;

/// Read-only view of the process filesystem.
pub trait ProcFs: Send + Sync {
    /// Read a whole file.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Names of the entries in a directory.
    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Target of a symbolic link.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
}

/// The host's real `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcFs;

impl ProcFs for SystemProcFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }
}

/// In-memory process filesystem with read counters.
#[derive(Debug, Default)]
pub struct MemoryProcFs {
    files: Mutex<HashMap<PathBuf, String>>,
    dirs: Mutex<HashMap<PathBuf, Vec<String>>>,
    links: Mutex<HashMap<PathBuf, PathBuf>>,
    file_reads: AtomicUsize,
}

impl MemoryProcFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.files.lock().insert(path.into(), contents.into());
        self
    }

    pub fn with_dir<S: Into<String>>(
        self,
        path: impl Into<PathBuf>,
        entries: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dirs
            .lock()
            .insert(path.into(), entries.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_link(self, path: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.links.lock().insert(path.into(), target.into());
        self
    }

    /// Number of `read_to_string` calls served so far.
    pub fn file_reads(&self) -> usize {
        self.file_reads.load(Ordering::SeqCst)
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
}

impl ProcFs for MemoryProcFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.file_reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        self.dirs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        self.links
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }
}

/// A malformed socket table field.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Malformed socket table entry: {0}")]
pub struct ProcParseError(String);

/// One row of a socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: u8,
    pub inode: u64,
}

/// Parse the contents of `/proc/net/tcp` or `/proc/net/tcp6`.
///
/// Malformed rows are skipped; a partial table still resolves what it can.
pub fn parse_proc_net_tcp(content: &str, is_ipv6: bool) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| parse_row(line, is_ipv6).ok())
        .collect()
}

fn parse_row(line: &str, is_ipv6: bool) -> Result<SocketEntry, ProcParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(ProcParseError(format!("short row: {line}")));
    }

    let parse_addr = |s: &str| -> Result<SocketAddr, ProcParseError> {
        let (ip, port) = if is_ipv6 {
            parse_hex_addr_v6(s)?
        } else {
            let (v4, port) = parse_hex_addr_v4(s)?;
            (IpAddr::V4(v4), port)
        };
        Ok(SocketAddr::new(ip, port))
    };

    let state = u8::from_str_radix(parts[3], 16)
        .map_err(|_| ProcParseError(format!("state {}", parts[3])))?;
    let inode = parts[9]
        .parse()
        .map_err(|_| ProcParseError(format!("inode {}", parts[9])))?;

    Ok(SocketEntry {
        local: parse_addr(parts[1])?,
        remote: parse_addr(parts[2])?,
        state,
        inode,
    })
}

/// Parse `0100007F:1F90` into `127.0.0.1:8080`.
fn parse_hex_addr_v4(s: &str) -> Result<(Ipv4Addr, u16), ProcParseError> {
    let (addr, port) = s
        .split_once(':')
        .ok_or_else(|| ProcParseError(format!("IPv4 address {s}")))?;
    let raw = u32::from_str_radix(addr, 16)
        .map_err(|_| ProcParseError(format!("IPv4 address {addr}")))?;
    let port = u16::from_str_radix(port, 16).map_err(|_| ProcParseError(format!("port {port}")))?;
    Ok((Ipv4Addr::from(raw.swap_bytes()), port))
}

/// Parse a 32-hex-char address made of four host-order words.
fn parse_hex_addr_v6(s: &str) -> Result<(IpAddr, u16), ProcParseError> {
    let (addr, port) = s
        .split_once(':')
        .ok_or_else(|| ProcParseError(format!("IPv6 address {s}")))?;
    if addr.len() != 32 || !addr.is_ascii() {
        return Err(ProcParseError(format!("IPv6 address {addr}, expected 32 hex digits")));
    }

    let mut octets = [0u8; 16];
    for i in 0..4 {
        let word_hex = addr
            .get(i * 8..(i + 1) * 8)
            .ok_or_else(|| ProcParseError(format!("IPv6 address {addr}")))?;
        let word = u32::from_str_radix(word_hex, 16)
            .map_err(|_| ProcParseError(format!("IPv6 word {word_hex}")))?;
        octets[i * 4..(i + 1) * 4].copy_from_slice(&word.swap_bytes().to_be_bytes());
    }
    let port = u16::from_str_radix(port, 16).map_err(|_| ProcParseError(format!("port {port}")))?;
    Ok((IpAddr::V6(Ipv6Addr::from(octets)), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    #[test]
    fn test_parse_hex_addr_v4_localhost() {
        let (addr, port) = parse_hex_addr_v4("0100007F:1F90").unwrap();
        assert_eq!(addr, Ipv4Addr::LOCALHOST);
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_parse_hex_addr_v6_loopback() {
        let (addr, port) = parse_hex_addr_v6("00000000000000000000000001000000:0050").unwrap();
        assert_eq!(addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 80);
    }

    #[test]
    fn test_parse_hex_addr_v6_rejects_non_ascii() {
        // 30 ASCII digits plus one two-byte character is 32 bytes long.
        let addr = format!("{}é:0050", "0".repeat(30));
        assert!(parse_hex_addr_v6(&addr).is_err());
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(parse_hex_addr_v4("00000000").is_err());
        assert!(parse_hex_addr_v4("GGGGGGGG:0050").is_err());
        assert!(parse_hex_addr_v4("00000000:GGGG").is_err());
        assert!(parse_hex_addr_v6("0000:0050").is_err());
    }

    #[test]
    fn test_parse_established_connection() {
        let content = format!(
            "{HEADER}\n   0: 0100007F:8AE1 0100007F:22B8 01 00000000:00000000 00:00000000 00000000   100        0 12345 1 0000000000000000 20 4 30 10 -1\n   1: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 999 1"
        );
        let entries = parse_proc_net_tcp(&content, false);
        assert_eq!(entries.len(), 2);

        let conn = &entries[0];
        assert_eq!(conn.local, "127.0.0.1:35553".parse().unwrap());
        assert_eq!(conn.remote, "127.0.0.1:8888".parse().unwrap());
        assert_eq!(conn.state, TCP_ESTABLISHED);
        assert_eq!(conn.inode, 12345);
        assert_eq!(entries[1].state, 0x0A);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let content = format!("{HEADER}\n   0: garbage\n   1: ZZ:ZZ 00000000:0000 01 a b c d e f g");
        assert!(parse_proc_net_tcp(&content, false).is_empty());
    }

    #[test]
    fn test_memory_procfs_counts_reads() {
        let fs = MemoryProcFs::new().with_file("/proc/1/comm", "init\n");
        assert_eq!(fs.read_to_string(Path::new("/proc/1/comm")).unwrap(), "init\n");
        assert!(fs.read_to_string(Path::new("/proc/2/comm")).is_err());
        assert_eq!(fs.file_reads(), 2);
    }
}
