//! Outbound TCP dialing.
//!
//! One `Dialer` value is built at startup and handed to every splicer,
//! carrying the optional fixed source IP and the dial timeout.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Dialer {
    local_ip: Option<IpAddr>,
    timeout: Duration,
}

impl Dialer {
    pub fn new(local_ip: Option<IpAddr>, timeout: Duration) -> Self {
        Self { local_ip, timeout }
    }

    /// Connect to a `host:port` target. Resolution and connection both
    /// run under the dial timeout; each resolved address is tried in
    /// order until one connects.
    pub async fn dial(&self, target: &str) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, self.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {target} timed out"),
            )),
        }
    }

    async fn connect(&self, target: &str) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(target).await? {
            match self.connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {target}"),
            )
        }))
    }

    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match self.local_ip {
            Some(ip) => {
                if ip.is_ipv4() != addr.is_ipv4() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "source address family does not match target",
                    ));
                }
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(ip, 0))?;
                socket.connect(addr).await
            }
            None => TcpStream::connect(addr).await,
        }
    }
}
