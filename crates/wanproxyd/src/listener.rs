//! Proxy listener: accepts inbound sockets and spawns a connector per
//! client.
//!
//! Each instance owns an accept task. Resource errors while accepting are
//! logged and that connection dropped; the listener itself keeps serving.
//! A configuration reload refreshes the connector setup in place and only
//! rebinds when the listen address actually changed.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

use wanproxy_core::config::{CodecKind, CodecStanza, ProxyStanza};

use crate::connector::{self, CodecLeg, ConnectorSetup};
use crate::event::{EventSystem, Interest};
use crate::registry::CacheRegistry;
use crate::stats::StreamCounts;

pub struct ProxyListener {
    name: String,
    /// Listen address as configured (may carry port 0).
    configured: String,
    /// Listen address as bound.
    listen: String,
    setup_tx: watch::Sender<Arc<ConnectorSetup>>,
    accept_task: tokio::task::JoinHandle<()>,
    stop: broadcast::Sender<()>,
}

impl ProxyListener {
    /// Bind and start accepting for one configured proxy instance.
    pub async fn spawn(
        stanza: ProxyStanza,
        registry: Arc<CacheRegistry>,
        events: &EventSystem,
    ) -> Result<Self> {
        let setup = Arc::new(build_setup(&stanza, &registry)?);
        let (setup_tx, setup_rx) = watch::channel(setup);

        let listener = TcpListener::bind(&stanza.listen)
            .await
            .with_context(|| format!("binding {}", stanza.listen))?;
        let local_addr = listener.local_addr().context("listener address")?;
        tracing::info!(proxy = %stanza.name, listen = %local_addr, "listening");

        // Connections subscribe to the same stop interest the daemon uses.
        let (stop_tx, _) = broadcast::channel(4);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            stanza.name.clone(),
            setup_rx,
            stop_tx.clone(),
            events.subscribe(Interest::Stop),
        ));

        Ok(Self {
            name: stanza.name,
            configured: stanza.listen,
            listen: local_addr.to_string(),
            setup_tx,
            accept_task,
            stop: stop_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resolved listen address (useful when configured with port 0).
    pub fn listen_addr(&self) -> &str {
        &self.listen
    }

    /// Apply a new stanza. New connections pick the setup up immediately;
    /// a changed listen address requires a rebind.
    pub async fn refresh(
        &mut self,
        stanza: ProxyStanza,
        registry: Arc<CacheRegistry>,
        events: &EventSystem,
    ) -> Result<()> {
        if stanza.listen != self.configured {
            tracing::info!(proxy = %stanza.name, listen = %stanza.listen, "listen address changed, rebinding");
            let replacement = Self::spawn(stanza, registry, events).await?;
            let old = std::mem::replace(self, replacement);
            old.shutdown();
            return Ok(());
        }

        tracing::info!(proxy = %stanza.name, peer = %stanza.connect, "refreshed proxy");
        let setup = Arc::new(build_setup(&stanza, &registry)?);
        let _ = self.setup_tx.send(setup);
        Ok(())
    }

    /// Live counter handles for both legs; the clones share storage with
    /// the filters, so reads see traffic as it flows.
    pub fn stream_counts(&self) -> (StreamCounts, StreamCounts) {
        let setup = self.setup_tx.borrow();
        (setup.local.counts.clone(), setup.remote.counts.clone())
    }

    pub fn print_stream_counts(&self) {
        let setup = self.setup_tx.borrow();
        if setup.local.counting {
            setup.local.counts.print(&self.name, "local");
        }
        if setup.remote.counting {
            setup.remote.counts.print(&self.name, "remote");
        }
    }

    /// Stop accepting and tell this instance's connections to close.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let _ = self.stop.send(());
    }
}

async fn accept_loop(
    listener: TcpListener,
    name: String,
    setup_rx: watch::Receiver<Arc<ConnectorSetup>>,
    conn_stop: broadcast::Sender<()>,
    mut stop: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(proxy = %name, client = %peer, "accepted client");
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!(error = %e, "set_nodelay failed");
                    }
                    let setup = setup_rx.borrow().clone();
                    tokio::spawn(connector::run(setup, socket, conn_stop.subscribe()));
                }
                Err(e) => {
                    // Out of descriptors or a transient accept error;
                    // the listener itself stays up.
                    tracing::error!(proxy = %name, error = %e, "accept error");
                }
            },
            _ = stop.recv() => {
                tracing::info!(proxy = %name, "listener stopping");
                let _ = conn_stop.send(());
                return;
            }
        }
    }
}

/// Resolve a stanza into the runtime setup: open caches, wire counters.
fn build_setup(stanza: &ProxyStanza, registry: &Arc<CacheRegistry>) -> Result<ConnectorSetup> {
    Ok(ConnectorSetup {
        name: stanza.name.clone(),
        connect: stanza.connect.clone(),
        client: stanza.role == wanproxy_core::config::Role::Client,
        secure: stanza.secure,
        local: build_leg(&stanza.local, registry)
            .with_context(|| format!("proxy {:?} local codec", stanza.name))?,
        remote: build_leg(&stanza.remote, registry)
            .with_context(|| format!("proxy {:?} remote codec", stanza.name))?,
        registry: registry.clone(),
    })
}

fn build_leg(stanza: &CodecStanza, registry: &Arc<CacheRegistry>) -> Result<CodecLeg> {
    let cache = match stanza.codec {
        CodecKind::None => None,
        CodecKind::Xcodec => Some(registry.open_configured(stanza)?),
    };
    Ok(CodecLeg {
        cache,
        compressor: stanza.compressor,
        counting: stanza.byte_counts,
        detect_http: stanza.detect_http,
        counts: StreamCounts::new(),
    })
}
