//! Dial target resolution.
//!
//! Supported target forms:
//!
//! - `ricochet:jlq67qzo6s4yp3sp` — prefixed onion label
//! - `jlq67qzo6s4yp3sp` — bare onion label
//! - `127.0.0.1:55555|jlq67qzo6s4yp3sp` — direct local connection, used by
//!   tests and local deployments
//!
//! Onion labels dial `<label>.onion:9878` through the SOCKS5 proxy unless a
//! local override is registered for them.

use crate::error::{Error, Result};
use crate::identity::ADDRESS_PREFIX;
use crate::SERVICE_PORT;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Resolves peer addresses to overlay connections.
#[derive(Clone)]
pub struct Resolver {
    socks_addr: SocketAddr,
    connect_timeout: Duration,
    local_overrides: Arc<Mutex<HashMap<String, SocketAddr>>>,
}

impl Resolver {
    /// A resolver using the given SOCKS5 proxy.
    pub fn new(socks_addr: SocketAddr) -> Self {
        Self {
            socks_addr,
            connect_timeout: Duration::from_secs(super::CONNECT_TIMEOUT_SECS),
            local_overrides: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Map a bare label to a direct local address instead of the overlay.
    pub fn set_local_override(&self, label: &str, addr: SocketAddr) {
        if let Ok(mut map) = self.local_overrides.lock() {
            map.insert(label.to_lowercase(), addr);
        }
    }

    fn local_override(&self, label: &str) -> Option<SocketAddr> {
        self.local_overrides.lock().ok()?.get(label).copied()
    }

    /// Dial a peer. Returns the connected stream.
    pub async fn dial(&self, target: &str) -> Result<TcpStream> {
        if let Some((addr, _label)) = target.split_once('|') {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| Error::Transport(format!("invalid local address '{}'", addr)))?;
            return self.dial_direct(addr).await;
        }

        let label = target.strip_prefix(ADDRESS_PREFIX).unwrap_or(target).to_lowercase();
        if let Some(addr) = self.local_override(&label) {
            return self.dial_direct(addr).await;
        }

        self.dial_socks(&label).await
    }

    async fn dial_direct(&self, addr: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("connect to {} failed: {}", addr, e)))?;
        Ok(stream)
    }

    async fn dial_socks(&self, label: &str) -> Result<TcpStream> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.socks_addr))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("SOCKS proxy unreachable: {}", e)))?;

        let hostname = format!("{}.onion", label);
        tokio::time::timeout(
            self.connect_timeout,
            socks5_connect(&mut stream, &hostname, SERVICE_PORT),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        Ok(stream)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], super::DEFAULT_SOCKS_PORT)))
    }
}

/// Perform a SOCKS5 CONNECT for a domain target.
async fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    // Greeting: version 5, one auth method, no-auth.
    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .map_err(|e| Error::Transport(format!("SOCKS5 greeting failed: {}", e)))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Transport(format!("SOCKS5 response failed: {}", e)))?;
    if response[0] != 0x05 || response[1] != 0x00 {
        return Err(Error::Transport("SOCKS5 authentication refused".into()));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(Error::Transport("hostname too long".into()));
    }
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.push(0x05); // version
    request.push(0x01); // connect
    request.push(0x00); // reserved
    request.push(0x03); // domain name
    request.push(host_bytes.len() as u8);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|e| Error::Transport(format!("SOCKS5 connect failed: {}", e)))?;

    let mut response = [0u8; 4];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Error::Transport(format!("SOCKS5 connect response failed: {}", e)))?;
    if response[0] != 0x05 {
        return Err(Error::Transport("invalid SOCKS5 version in response".into()));
    }
    if response[1] != 0x00 {
        return Err(Error::Transport(format!("SOCKS5 connect error code {}", response[1])));
    }

    // Consume the bound address.
    match response[3] {
        0x01 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await.map_err(|e| Error::Transport(e.to_string()))?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(|e| Error::Transport(e.to_string()))?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await.map_err(|e| Error::Transport(e.to_string()))?;
        }
        0x04 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await.map_err(|e| Error::Transport(e.to_string()))?;
        }
        _ => return Err(Error::Transport("invalid SOCKS5 address type".into())),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn piped_local_form_dials_directly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accept = tokio::spawn(async move { listener.accept().await });

        let resolver = Resolver::default();
        let target = format!("{}|jlq67qzo6s4yp3sp", addr);
        resolver.dial(&target).await.expect("dial");
        accept.await.expect("join").expect("accept");
    }

    #[tokio::test]
    async fn local_override_bypasses_the_proxy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let accept = tokio::spawn(async move { listener.accept().await });

        let resolver = Resolver::default();
        resolver.set_local_override("jlq67qzo6s4yp3sp", addr);
        resolver.dial("ricochet:jlq67qzo6s4yp3sp").await.expect("dial");
        accept.await.expect("join").expect("accept");
    }

    #[tokio::test]
    async fn malformed_local_form_is_rejected() {
        let resolver = Resolver::default();
        let err = resolver.dial("not-an-address|label").await.expect_err("must fail");
        assert!(matches!(err, Error::Transport(_)));
    }
}
