//! The HTTPS splicer.
//!
//! Accepts raw TCP, peeks the TLS ClientHello for its SNI, applies the
//! allow-list, dials the named origin, replays the buffered hello and
//! then splices bytes in both directions until either side goes away.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use snirelay_shared::rules::RuleSet;
use snirelay_shared::sni::extract_sni;
use snirelay_shared::tls::{TlsConn, MSG_CLIENT_HELLO};
use snirelay_shared::{Error, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::normalize_listen;
use crate::dialer::Dialer;

pub struct HttpsProxy {
    rules: Arc<RuleSet>,
    dialer: Dialer,
    listen: String,
}

impl HttpsProxy {
    pub fn new(rules: Arc<RuleSet>, dialer: Dialer, listen: String) -> Self {
        Self {
            rules,
            dialer,
            listen,
        }
    }

    /// Bind the listen address and start accepting. A bind failure is
    /// returned to the caller (fatal at startup); accept failures are
    /// logged and the loop keeps going.
    pub async fn start(self) -> anyhow::Result<JoinHandle<()>> {
        let listener = TcpListener::bind(normalize_listen(&self.listen))
            .await
            .with_context(|| format!("unable to listen on {}", self.listen))?;
        info!("start serving https at {}", self.listen);
        let HttpsProxy { rules, dialer, .. } = self;
        Ok(tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("error when accepting: {e}");
                        continue;
                    }
                };
                debug!(%peer, "received connection");
                let rules = Arc::clone(&rules);
                let dialer = dialer.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer, rules, dialer).await {
                        info!(%peer, error = %e, "https session closed");
                    }
                });
            }
        }))
    }
}

/// Handle one accepted connection end to end. Dropping the streams on
/// any exit path is what closes the sockets.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    rules: Arc<RuleSet>,
    dialer: Dialer,
) -> Result<()> {
    let mut client = TlsConn::new(stream);
    let hello = client.read_message().await?;
    if !hello.is_handshake() || hello.msg_type() != MSG_CLIENT_HELLO {
        warn!(%peer, "first message is not a ClientHello");
        return Err(Error::InvalidTlsProtocol);
    }

    let server_name = extract_sni(&hello)?;
    if !rules.is_host_allowed(&server_name) {
        return Err(Error::TargetRejected);
    }
    let target = ensure_port(&server_name, 443);
    info!(scheme = "https", from = %peer, to = %target, "access");

    let upstream = match dialer.dial(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            info!(remote = %target, error = %e, "remote connect failed");
            return Err(e.into());
        }
    };
    let mut server = TlsConn::new(upstream);
    server.write_message(&hello).await?;

    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();
    // Whichever direction finishes first wins the select; dropping the
    // other future closes its halves and with them the peer sockets.
    tokio::select! {
        result = client_read.copy_to(server_write) => {
            result?;
        }
        result = server_read.copy_to(client_write) => {
            result?;
        }
    }
    Ok(())
}

/// Append the default port when the target does not already carry one.
fn ensure_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}
