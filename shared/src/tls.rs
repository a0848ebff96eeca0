//! TLS record and handshake framing.
//!
//! Reads just enough of a TLS session's opening to hand individual
//! handshake messages to higher layers without decrypting anything,
//! while keeping every consumed byte replayable: bytes pulled off the
//! socket are either returned inside a message or still pending in the
//! peek buffer, never dropped.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};

pub const RECORD_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const RECORD_ALERT: u8 = 0x15;
pub const RECORD_HANDSHAKE: u8 = 0x16;
pub const RECORD_APPLICATION_DATA: u8 = 0x17;

pub const MSG_HELLO_REQUEST: u8 = 0;
pub const MSG_CLIENT_HELLO: u8 = 1;
pub const MSG_SERVER_HELLO: u8 = 2;
pub const MSG_NEW_SESSION_TICKET: u8 = 4;
pub const MSG_END_OF_EARLY_DATA: u8 = 5;
pub const MSG_ENCRYPTED_EXTENSIONS: u8 = 8;
pub const MSG_CERTIFICATE: u8 = 0x0b;
pub const MSG_SERVER_KEY_EXCHANGE: u8 = 0x0c;
pub const MSG_CERTIFICATE_REQUEST: u8 = 0x0d;
pub const MSG_SERVER_DONE: u8 = 0x0e;
pub const MSG_CERTIFICATE_VERIFY: u8 = 0x0f;
pub const MSG_CLIENT_KEY_EXCHANGE: u8 = 0x10;
// Shares its value with the ChangeCipherSpec record type.
pub const MSG_FINISHED: u8 = 0x14;
pub const MSG_CERTIFICATE_STATUS: u8 = 22;
pub const MSG_KEY_UPDATE: u8 = 24;
pub const MSG_MESSAGE_HASH: u8 = 254;

fn is_known_handshake_type(msg_type: u8) -> bool {
    matches!(
        msg_type,
        MSG_HELLO_REQUEST
            | MSG_CLIENT_HELLO
            | MSG_SERVER_HELLO
            | MSG_NEW_SESSION_TICKET
            | MSG_END_OF_EARLY_DATA
            | MSG_ENCRYPTED_EXTENSIONS
            | MSG_CERTIFICATE
            | MSG_SERVER_KEY_EXCHANGE
            | MSG_CERTIFICATE_REQUEST
            | MSG_SERVER_DONE
            | MSG_CERTIFICATE_VERIFY
            | MSG_CLIENT_KEY_EXCHANGE
            | MSG_FINISHED
            | MSG_CERTIFICATE_STATUS
            | MSG_KEY_UPDATE
            | MSG_MESSAGE_HASH
    )
}

/// One unit read from a TLS connection: either a whole non-handshake
/// record (head is the 5-byte record header) or a single handshake
/// message (head is the 4-byte handshake header).
#[derive(Debug, Clone)]
pub struct TlsMessage {
    head: Vec<u8>,
    data: Vec<u8>,
    is_handshake: bool,
    // legacy_version of the record the message arrived in, kept so the
    // message can be re-framed for the upstream peer.
    version: Option<[u8; 2]>,
}

impl TlsMessage {
    pub fn msg_type(&self) -> u8 {
        self.head[0]
    }

    pub fn is_handshake(&self) -> bool {
        self.is_handshake
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn version(&self) -> Option<[u8; 2]> {
        self.version
    }
}

/// A byte stream with TLS-aware peeking.
///
/// `buffer` holds handshake payload that has been consumed from the
/// transport but not yet returned from [`read_message`]; `version` is the
/// `legacy_version` of the first record observed on this connection.
///
/// [`read_message`]: TlsConn::read_message
#[derive(Debug)]
pub struct TlsConn<S> {
    stream: S,
    buffer: Vec<u8>,
    version: Option<[u8; 2]>,
}

impl<S> TlsConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            version: None,
        }
    }

    /// Bytes received but not yet delivered as messages.
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Parse one handshake message off the head of the peek buffer.
    fn next_buffered_message(&mut self) -> Result<TlsMessage> {
        if self.buffer.len() < 4 {
            debug!("handshake message shorter than its 4 byte header");
            return Err(Error::InvalidTlsPacket);
        }
        if !is_known_handshake_type(self.buffer[0]) {
            debug!(msg_type = self.buffer[0], "unknown TLS handshake type");
            return Err(Error::InvalidTlsPacket);
        }
        let body_len =
            u32::from_be_bytes([0, self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if self.buffer.len() < 4 + body_len {
            // The message continues in a record we have not read. Spanning
            // records is rejected rather than accumulated.
            debug!(
                body_len,
                buffered = self.buffer.len(),
                "handshake message crosses a record boundary"
            );
            return Err(Error::InvalidTlsPacket);
        }
        let head = self.buffer[..4].to_vec();
        let data = self.buffer[4..4 + body_len].to_vec();
        self.buffer.drain(..4 + body_len);
        Ok(TlsMessage {
            head,
            data,
            is_handshake: true,
            version: self.version,
        })
    }
}

impl<S: AsyncRead + Unpin> TlsConn<S> {
    /// Read the next message: a non-handshake record verbatim, or one
    /// handshake message parsed out of the current handshake record.
    pub async fn read_message(&mut self) -> Result<TlsMessage> {
        if self.buffer.is_empty() {
            let mut head = [0u8; 5];
            self.stream.read_exact(&mut head).await?;
            // Middlebox-tolerant version check: only the major byte must
            // be 3.
            if head[1] != 3 {
                debug!(major = head[1], minor = head[2], "invalid TLS version");
                return Err(Error::InvalidTlsPacket);
            }
            if self.version.is_none() {
                self.version = Some([head[1], head[2]]);
            }
            let length = u16::from_be_bytes([head[3], head[4]]) as usize;
            debug!(
                content_type = head[0],
                length, "read TLS record header"
            );
            match head[0] {
                RECORD_ALERT | RECORD_CHANGE_CIPHER_SPEC | RECORD_APPLICATION_DATA => {
                    let mut data = vec![0u8; length];
                    self.stream.read_exact(&mut data).await?;
                    return Ok(TlsMessage {
                        head: head.to_vec(),
                        data,
                        is_handshake: false,
                        version: None,
                    });
                }
                RECORD_HANDSHAKE => {
                    self.buffer.resize(length, 0);
                    self.stream.read_exact(&mut self.buffer).await?;
                }
                other => {
                    debug!(content_type = other, "unexpected TLS record type");
                    return Err(Error::InvalidTlsPacket);
                }
            }
        }
        self.next_buffered_message()
    }
}

impl<S: AsyncWrite + Unpin> TlsConn<S> {
    /// Write a message back out. Non-handshake records go out unchanged;
    /// handshake messages get a freshly synthesized record header around
    /// them, which loses the original record boundaries but preserves the
    /// handshake bytes.
    pub async fn write_message(&mut self, msg: &TlsMessage) -> Result<()> {
        if msg.is_handshake {
            let version = msg.version.unwrap_or([3, 3]);
            let length = (msg.head.len() + msg.data.len()) as u16;
            let mut head = [RECORD_HANDSHAKE, version[0], version[1], 0, 0];
            head[3..5].copy_from_slice(&length.to_be_bytes());
            self.stream.write_all(&head).await?;
            self.stream.write_all(&msg.head).await?;
            self.stream.write_all(&msg.data).await?;
        } else {
            self.stream.write_all(&msg.head).await?;
            self.stream.write_all(&msg.data).await?;
        }
        debug!(
            is_handshake = msg.is_handshake,
            len = msg.data.len(),
            "wrote TLS message"
        );
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> TlsConn<R> {
    /// Forward everything from this connection into `dst`: first drain
    /// any handshake messages still sitting in the peek buffer (each gets
    /// re-framed by `write_message`), then hand the rest of the stream to
    /// a raw byte copy until EOF or error.
    ///
    /// Consumes both endpoints; whichever task drops out first closes its
    /// sockets by drop, which is what breaks the peer direction.
    pub async fn copy_to<W: AsyncWrite + Unpin>(mut self, mut dst: TlsConn<W>) -> Result<u64> {
        while self.has_buffered() {
            let msg = self.next_buffered_message()?;
            dst.write_message(&msg).await?;
        }
        let copied = tokio::io::copy(&mut self.stream, &mut dst.stream).await?;
        let _ = dst.stream.shutdown().await;
        Ok(copied)
    }
}

impl TlsConn<TcpStream> {
    /// Split into independently owned read and write sides for splicing.
    /// The peek buffer and recorded version travel with the read side.
    pub fn into_split(self) -> (TlsConn<OwnedReadHalf>, TlsConn<OwnedWriteHalf>) {
        let (read, write) = self.stream.into_split();
        (
            TlsConn {
                stream: read,
                buffer: self.buffer,
                version: self.version,
            },
            TlsConn::new(write),
        )
    }
}
