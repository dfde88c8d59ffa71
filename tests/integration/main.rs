//! End-to-end tests: two full proxy instances in-process, paired over
//! localhost TCP, with a plain echo origin behind them.
//!
//! Topology per test:
//!
//!   app ──> client proxy ──> server proxy ──> origin (echo)
//!
//! Each proxy gets its own cache registry and event system, as two real
//! daemons would.

mod proxy_pair;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wanproxy_core::config::{CacheKind, CodecKind, CodecStanza, ProxyStanza, Role};
use wanproxyd::event::EventSystem;
use wanproxyd::listener::ProxyListener;
use wanproxyd::registry::CacheRegistry;

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawn a TCP echo server; returns its address. Echoes until the client
/// half-closes, then half-closes back.
pub async fn spawn_echo_origin() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });
    Ok(addr)
}

/// One in-process proxy daemon instance.
pub struct Instance {
    pub listener: ProxyListener,
    _events: EventSystem,
    _registry: Arc<CacheRegistry>,
}

impl Instance {
    pub async fn spawn(stanza: ProxyStanza) -> Result<Self> {
        let events = EventSystem::new()?;
        let registry = Arc::new(CacheRegistry::new());
        let listener = ProxyListener::spawn(stanza, registry.clone(), &events)
            .await
            .context("spawning proxy instance")?;
        Ok(Self {
            listener,
            _events: events,
            _registry: registry,
        })
    }

    pub fn addr(&self) -> String {
        self.listener.listen_addr().to_string()
    }
}

/// A dedup codec stanza backed by a memory cache.
pub fn xcodec_memory(byte_counts: bool) -> CodecStanza {
    CodecStanza {
        codec: CodecKind::Xcodec,
        cache: CacheKind::Memory,
        byte_counts,
        ..CodecStanza::default()
    }
}

/// Stand up the standard pair; returns (client instance, server instance).
///
/// `decorate` lets a test adjust both stanzas (compression, ssh, ...)
/// before the instances start.
pub async fn spawn_pair(
    origin: &str,
    client_remote: CodecStanza,
    server_local: CodecStanza,
    decorate: impl Fn(&mut ProxyStanza),
) -> Result<(Instance, Instance)> {
    let mut server = ProxyStanza {
        name: "server-side".to_string(),
        listen: "127.0.0.1:0".to_string(),
        connect: origin.to_string(),
        role: Role::Server,
        secure: false,
        local: server_local,
        remote: CodecStanza::default(),
    };
    decorate(&mut server);
    let server = Instance::spawn(server).await?;

    let mut client = ProxyStanza {
        name: "client-side".to_string(),
        listen: "127.0.0.1:0".to_string(),
        connect: server.addr(),
        role: Role::Client,
        secure: false,
        local: CodecStanza::default(),
        remote: client_remote,
    };
    decorate(&mut client);
    let client = Instance::spawn(client).await?;

    Ok((client, server))
}

/// Send `payload` through the pair and read the echo back, half-closing
/// after the write.
pub async fn echo_through(addr: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let mut socket = TcpStream::connect(addr).await.context("connecting to proxy")?;
    socket.set_nodelay(true)?;

    tokio::time::timeout(IO_TIMEOUT, socket.write_all(payload))
        .await
        .context("write timed out")??;
    tokio::time::timeout(IO_TIMEOUT, socket.shutdown())
        .await
        .context("shutdown timed out")??;

    let mut echoed = Vec::with_capacity(payload.len());
    tokio::time::timeout(IO_TIMEOUT, socket.read_to_end(&mut echoed))
        .await
        .context("read timed out")??;
    Ok(echoed)
}
