//! ClientHello inspection and the MITM bypass list.

use crate::policy::matches_glob;

/// Hosts that pin their certificates. Intercepting them only breaks the
/// client, so their connections are tunneled without decryption.
pub const PINNED_DOMAINS: &[&str] = &[
    "api.openai.com",
    "*.apple.com",
    "*.icloud.com",
    "*.mzstatic.com",
    "*.googleapis.com",
    "*.gvt1.com",
    "*.dropbox.com",
    "*.1password.com",
    "*.mozilla.org",
];

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

/// Whether a host should be tunneled opaquely instead of intercepted.
pub fn should_bypass_mitm<S: AsRef<str>>(domain: &str, extra: &[S]) -> bool {
    PINNED_DOMAINS
        .iter()
        .copied()
        .chain(extra.iter().map(AsRef::as_ref))
        .any(|pattern| matches_glob(pattern, domain))
}

/// Extract the `server_name` from a TLS ClientHello.
///
/// Returns `None` for anything that is not a well-formed ClientHello
/// carrying a host name, including a record truncated mid-extension.
pub fn parse_sni_from_client_hello(data: &[u8]) -> Option<String> {
    let mut r = Reader::new(data);

    // Record header: type, version, length.
    if r.u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    r.skip(2)?;
    let record_len = r.u16()? as usize;
    let mut r = Reader::new(r.take(record_len.min(r.remaining()))?);

    // Handshake header: type, 24-bit length.
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    r.skip(3)?;

    // Version, random, session id, cipher suites, compression methods.
    r.skip(2 + 32)?;
    let session_len = r.u8()? as usize;
    r.skip(session_len)?;
    let suites_len = r.u16()? as usize;
    r.skip(suites_len)?;
    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let mut ext = Reader::new(r.take(extensions_len)?);

    while ext.remaining() >= 4 {
        let ext_type = ext.u16()?;
        let ext_len = ext.u16()? as usize;
        let body = ext.take(ext_len)?;
        if ext_type != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = Reader::new(body);
        let list_len = names.u16()? as usize;
        let mut list = Reader::new(names.take(list_len)?);
        while list.remaining() >= 3 {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == NAME_TYPE_HOST {
                let host = std::str::from_utf8(name).ok()?;
                return (!host.is_empty()).then(|| host.to_ascii_lowercase());
            }
        }
        return None;
    }
    None
}

/// Bounds-checked big-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
pub(crate) fn build_client_hello(server_name: &str) -> Vec<u8> {
    let host = server_name.as_bytes();
    let host_len = host.len() as u16;

    let mut sni = vec![0x00, 0x00];
    sni.extend_from_slice(&(host_len + 5).to_be_bytes());
    sni.extend_from_slice(&(host_len + 3).to_be_bytes());
    sni.push(NAME_TYPE_HOST);
    sni.extend_from_slice(&host_len.to_be_bytes());
    sni.extend_from_slice(host);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x01; 32]);
    body.push(0x00);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
    body.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    body.extend_from_slice(&sni);

    let body_len = body.len() as u32;
    let mut hello = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    hello.extend_from_slice(&((body_len + 4) as u16).to_be_bytes());
    hello.push(HANDSHAKE_CLIENT_HELLO);
    hello.extend_from_slice(&body_len.to_be_bytes()[1..]);
    hello.extend_from_slice(&body);
    hello
}
