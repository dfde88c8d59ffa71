//! wanproxyd — the paired-proxy daemon.
//!
//! A library crate so the integration tests can stand up full proxy
//! instances in-process; the `wanproxyd` binary is a thin wrapper around
//! [`run`].

pub mod connector;
pub mod event;
pub mod listener;
pub mod registry;
pub mod stats;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use wanproxy_core::config::WanProxyConfig;

use event::{EventSystem, Interest};
use listener::ProxyListener;
use registry::CacheRegistry;

/// Load the configuration, start every proxy instance and run until the
/// stop interest fires. `SIGHUP` reloads the configuration in place.
pub async fn run(config_path: &Path) -> Result<()> {
    let events = EventSystem::new().context("event system setup")?;
    let registry = Arc::new(CacheRegistry::new());

    let config = WanProxyConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let mut listeners: Vec<ProxyListener> = Vec::new();
    for stanza in &config.proxies {
        let listener = ProxyListener::spawn(stanza.clone(), registry.clone(), &events)
            .await
            .with_context(|| format!("starting proxy {:?}", stanza.name))?;
        listeners.push(listener);
    }

    let mut reload = events.subscribe(Interest::Reload);
    let mut stop = events.subscribe(Interest::Stop);
    let signal_driver = tokio::spawn(events.clone().drive_signals());

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = reload.recv() => {
                match WanProxyConfig::load(config_path) {
                    Ok(config) => {
                        reconfigure(&mut listeners, config, &registry, &events).await;
                        tracing::info!("reloaded proxy configuration");
                    }
                    Err(e) => tracing::warn!(error = %e, "could not reconfigure proxies"),
                }
            }
        }
    }

    for listener in &listeners {
        listener.print_stream_counts();
    }
    signal_driver.abort();
    Ok(())
}

/// Apply a freshly loaded configuration: refresh matching instances,
/// start new ones, drop removed ones.
async fn reconfigure(
    listeners: &mut Vec<ProxyListener>,
    config: WanProxyConfig,
    registry: &Arc<CacheRegistry>,
    events: &EventSystem,
) {
    let mut kept: Vec<ProxyListener> = Vec::new();

    for stanza in config.proxies {
        if let Some(pos) = listeners.iter().position(|l| l.name() == stanza.name) {
            let mut listener = listeners.remove(pos);
            if let Err(e) = listener.refresh(stanza, registry.clone(), events).await {
                tracing::warn!(error = %e, "listener refresh failed");
            }
            kept.push(listener);
        } else {
            match ProxyListener::spawn(stanza.clone(), registry.clone(), events).await {
                Ok(listener) => kept.push(listener),
                Err(e) => tracing::warn!(proxy = %stanza.name, error = %e, "cannot start proxy"),
            }
        }
    }

    // Anything left in `listeners` disappeared from the configuration.
    for removed in listeners.drain(..) {
        tracing::info!(proxy = %removed.name(), "stopping removed proxy");
        removed.shutdown();
    }
    *listeners = kept;
}
