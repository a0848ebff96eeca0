//! SNI extraction from a TLS ClientHello.
//!
//! Parsing is strict: any length that does not line up with the bytes
//! actually present aborts with [`Error::InvalidClientHello`]. A
//! ClientHello without extensions is legal and yields an empty name.

use tracing::debug;

use crate::error::{Error, Result};
use crate::tls::{TlsMessage, MSG_CLIENT_HELLO};

const EXTENSION_SERVER_NAME: u16 = 0;
const SNI_NAME_TYPE_HOST: u8 = 0;

fn read_u16(data: &[u8]) -> usize {
    u16::from_be_bytes([data[0], data[1]]) as usize
}

/// Extract the server name from a ClientHello handshake message.
///
/// Returns an empty string when the extension block is absent or carries
/// no host-typed entry. Name bytes are not validated as DNS labels, but
/// must be UTF-8.
pub fn extract_sni(msg: &TlsMessage) -> Result<String> {
    if !msg.is_handshake() || msg.head().len() != 4 || msg.msg_type() != MSG_CLIENT_HELLO {
        debug!("message is not a ClientHello");
        return Err(Error::InvalidClientHello);
    }
    let data = msg.data();

    // legacy_version(2) + random(32) + session_id length(1)
    if data.len() < 2 + 32 + 1 {
        return Err(Error::InvalidClientHello);
    }
    let session_id_len = data[2 + 32] as usize;
    if session_id_len > 32 || data.len() < 2 + 32 + 1 + session_id_len {
        debug!(session_id_len, "invalid session id length");
        return Err(Error::InvalidClientHello);
    }
    let mut rest = &data[2 + 32 + 1 + session_id_len..];

    // Cipher suites are u16s, so the byte count must be even.
    if rest.len() < 2 {
        return Err(Error::InvalidClientHello);
    }
    let cipher_suites_len = read_u16(rest);
    if cipher_suites_len % 2 == 1 || rest.len() < 2 + cipher_suites_len {
        debug!(cipher_suites_len, "invalid cipher suites length");
        return Err(Error::InvalidClientHello);
    }
    rest = &rest[2 + cipher_suites_len..];

    if rest.is_empty() {
        return Err(Error::InvalidClientHello);
    }
    let compression_methods_len = rest[0] as usize;
    if rest.len() < 1 + compression_methods_len {
        debug!(compression_methods_len, "invalid compression methods length");
        return Err(Error::InvalidClientHello);
    }
    rest = &rest[1 + compression_methods_len..];

    if rest.is_empty() {
        // Extensions are optional; without them there is no SNI.
        return Ok(String::new());
    }
    if rest.len() < 2 {
        return Err(Error::InvalidClientHello);
    }
    let extensions_len = read_u16(rest);
    rest = &rest[2..];
    if extensions_len != rest.len() {
        debug!(
            extensions_len,
            remaining = rest.len(),
            "extensions length does not match remaining bytes"
        );
        return Err(Error::InvalidClientHello);
    }

    let mut server_name = String::new();
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::InvalidClientHello);
        }
        let extension = read_u16(&rest[0..2]);
        let length = read_u16(&rest[2..4]);
        rest = &rest[4..];
        if rest.len() < length {
            return Err(Error::InvalidClientHello);
        }

        if extension == EXTENSION_SERVER_NAME as usize {
            server_name = parse_server_name_list(&rest[..length])?;
        }
        rest = &rest[length..];
    }
    debug!(server_name = %server_name, "parsed ClientHello");
    Ok(server_name)
}

/// Walk the server_name_list and return the first host-typed entry,
/// or an empty string when none is present.
fn parse_server_name_list(value: &[u8]) -> Result<String> {
    if value.len() < 2 {
        return Err(Error::InvalidClientHello);
    }
    let mut entries = &value[2..];
    while !entries.is_empty() {
        if entries.len() < 3 {
            return Err(Error::InvalidClientHello);
        }
        let name_type = entries[0];
        let name_len = read_u16(&entries[1..3]);
        entries = &entries[3..];
        if entries.len() < name_len {
            return Err(Error::InvalidClientHello);
        }
        if name_type == SNI_NAME_TYPE_HOST {
            return String::from_utf8(entries[..name_len].to_vec())
                .map_err(|_| Error::InvalidClientHello);
        }
        entries = &entries[name_len..];
    }
    Ok(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{TlsConn, RECORD_HANDSHAKE};
    use tokio::io::AsyncWriteExt;

    /// Assemble a ClientHello body with the given parts.
    fn hello_body(
        session_id_len: u8,
        session_id_bytes: usize,
        cipher_suites: &[u8],
        extensions: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut body = vec![3, 3];
        body.extend_from_slice(&[0u8; 32]);
        body.push(session_id_len);
        body.extend(std::iter::repeat(0u8).take(session_id_bytes));
        body.extend_from_slice(&(cipher_suites.len() as u16).to_be_bytes());
        body.extend_from_slice(cipher_suites);
        body.push(0); // no compression methods
        if let Some(ext) = extensions {
            body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            body.extend_from_slice(ext);
        }
        body
    }

    fn sni_extension(name: &[u8]) -> Vec<u8> {
        let mut entry = vec![SNI_NAME_TYPE_HOST];
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);

        let mut value = (entry.len() as u16).to_be_bytes().to_vec();
        value.extend_from_slice(&entry);

        let mut ext = 0u16.to_be_bytes().to_vec();
        ext.extend_from_slice(&(value.len() as u16).to_be_bytes());
        ext.extend_from_slice(&value);
        ext
    }

    async fn client_hello_message(body: &[u8]) -> TlsMessage {
        let mut fragment = vec![MSG_CLIENT_HELLO];
        fragment.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        fragment.extend_from_slice(body);

        let mut wire = vec![RECORD_HANDSHAKE, 3, 1];
        wire.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
        wire.extend_from_slice(&fragment);

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        far.write_all(&wire).await.unwrap();
        drop(far);
        TlsConn::new(near).read_message().await.unwrap()
    }

    #[tokio::test]
    async fn extracts_server_name() {
        let ext = sni_extension(b"example.com");
        let body = hello_body(4, 4, &[0, 1, 0, 2], Some(&ext));
        let msg = client_hello_message(&body).await;
        assert_eq!(extract_sni(&msg).unwrap(), "example.com");
    }

    #[tokio::test]
    async fn missing_extensions_yield_empty_name() {
        let body = hello_body(0, 0, &[0, 1], None);
        let msg = client_hello_message(&body).await;
        assert_eq!(extract_sni(&msg).unwrap(), "");
    }

    #[tokio::test]
    async fn sni_list_without_host_entry_yields_empty_name() {
        // One entry with a non-host name type.
        let mut entry = vec![7u8];
        entry.extend_from_slice(&3u16.to_be_bytes());
        entry.extend_from_slice(b"abc");
        let mut value = (entry.len() as u16).to_be_bytes().to_vec();
        value.extend_from_slice(&entry);
        let mut ext = 0u16.to_be_bytes().to_vec();
        ext.extend_from_slice(&(value.len() as u16).to_be_bytes());
        ext.extend_from_slice(&value);

        let body = hello_body(0, 0, &[0, 1], Some(&ext));
        let msg = client_hello_message(&body).await;
        assert_eq!(extract_sni(&msg).unwrap(), "");
    }

    #[tokio::test]
    async fn rejects_oversized_session_id() {
        let body = hello_body(33, 33, &[0, 1], None);
        let msg = client_hello_message(&body).await;
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }

    #[tokio::test]
    async fn rejects_session_id_longer_than_body() {
        // Declares 30 bytes of session id but carries none.
        let body = hello_body(30, 0, &[], None);
        let msg = client_hello_message(&body[..2 + 32 + 1]).await;
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }

    #[tokio::test]
    async fn rejects_odd_cipher_suites_length() {
        let body = hello_body(0, 0, &[0, 1, 0], None);
        let msg = client_hello_message(&body).await;
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }

    #[tokio::test]
    async fn rejects_extensions_length_mismatch() {
        let ext = sni_extension(b"example.com");
        let mut body = hello_body(0, 0, &[0, 1], Some(&ext));
        // Append a stray byte so the declared extensions length is short.
        body.push(0);
        let msg = client_hello_message(&body).await;
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }

    #[tokio::test]
    async fn rejects_truncated_extension_header() {
        let body = hello_body(0, 0, &[0, 1], Some(&[0, 0, 0]));
        let msg = client_hello_message(&body).await;
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }

    #[tokio::test]
    async fn rejects_non_client_hello_message() {
        let wire = {
            let mut fragment = vec![crate::tls::MSG_SERVER_HELLO, 0, 0, 2, 0xaa, 0xbb];
            let mut w = vec![RECORD_HANDSHAKE, 3, 3];
            w.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
            w.append(&mut fragment);
            w
        };
        let (near, mut far) = tokio::io::duplex(1024);
        far.write_all(&wire).await.unwrap();
        drop(far);
        let msg = TlsConn::new(near).read_message().await.unwrap();
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }

    #[tokio::test]
    async fn malformed_extension_after_sni_still_fails() {
        let mut ext = sni_extension(b"example.com");
        // A second extension whose declared length overruns the block.
        ext.extend_from_slice(&[0, 0x10, 0, 9, 1]);
        let body = hello_body(0, 0, &[0, 1], Some(&ext));
        let msg = client_hello_message(&body).await;
        assert!(matches!(
            extract_sni(&msg),
            Err(Error::InvalidClientHello)
        ));
    }
}
