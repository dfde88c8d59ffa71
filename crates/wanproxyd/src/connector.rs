//! Per-connection plumbing: connects the remote side, builds the two
//! filter chains and pumps bytes between the sockets until both
//! directions have drained.
//!
//! Chain order on the request path (accepted client toward the connect
//! address): SSH decrypt, count, inflate, dedup decode, count | count,
//! dedup encode, deflate, count, SSH encrypt — with the symmetric inverse
//! on the response path and the SSH roles swapped. Decode and decrypt
//! filters are linked to their counterparts in the opposite chain so
//! dictionary and handshake control traffic rides the reverse direction.
//!
//! Every error here — protocol, I/O or cipher — tears down this
//! connection and nothing else.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, AsyncReadExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use wanproxy_filters::chain::{
    ChainRun, FilterChain, Flags, PeerOp, REQUEST_CHAIN_READY, RESPONSE_CHAIN_READY,
};
use wanproxy_filters::ssh::{self, new_session};
use wanproxy_filters::{
    CountFilter, DecodeFilter, DecryptFilter, DeflateFilter, EncodeFilter, EncryptFilter,
    InflateFilter,
};
use wanproxy_core::cache::CacheResolver;
use wanproxy_core::SharedCache;

use crate::registry::CacheRegistry;
use crate::stats::StreamCounts;

const READ_CHUNK: usize = 64 * 1024;

/// Everything the connector needs to know about one codec leg.
#[derive(Clone)]
pub struct CodecLeg {
    pub cache: Option<SharedCache>,
    pub compressor: Option<u32>,
    pub counting: bool,
    pub detect_http: bool,
    pub counts: StreamCounts,
}

/// Immutable per-instance setup shared by all of its connections.
pub struct ConnectorSetup {
    pub name: String,
    pub connect: String,
    /// True on the client side of the pair, where the connect address is
    /// the peer proxy. Failures reaching it are routine there; on the
    /// server side they mean the origin is down.
    pub client: bool,
    pub secure: bool,
    pub local: CodecLeg,
    pub remote: CodecLeg,
    pub registry: Arc<CacheRegistry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Request,
    Response,
}

impl Dir {
    fn other(self) -> Self {
        match self {
            Dir::Request => Dir::Response,
            Dir::Response => Dir::Request,
        }
    }
}

enum Job {
    Consume(BytesMut),
    Flush(Flags),
    Inject(usize, PeerOp),
}

/// Drive one accepted connection to completion.
pub async fn run(
    setup: Arc<ConnectorSetup>,
    local: TcpStream,
    mut stop: broadcast::Receiver<()>,
) {
    let peer = local
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());

    let remote = match TcpStream::connect(&setup.connect).await {
        Ok(remote) => remote,
        Err(e) => {
            if setup.client {
                tracing::info!(proxy = %setup.name, error = %e, "connect failed");
            } else {
                tracing::warn!(proxy = %setup.name, error = %e, "origin unreachable");
            }
            return;
        }
    };
    tracing::debug!(proxy = %setup.name, client = %peer, remote = %setup.connect, "connection open");

    if let Err(e) = pump(&setup, local, remote, &mut stop).await {
        tracing::debug!(proxy = %setup.name, client = %peer, error = %e, "connection closed on error");
    } else {
        tracing::debug!(proxy = %setup.name, client = %peer, "connection closed");
    }
}

/// Build both chains per the configured legs. Returns the chains with
/// their cross-links installed.
fn build_chains(setup: &ConnectorSetup) -> (FilterChain, FilterChain) {
    let mut request = FilterChain::new();
    let mut response = FilterChain::new();

    let resolver: Arc<dyn CacheResolver> = setup.registry.clone();

    // The SSH pair protects the link between the two proxy instances, so
    // it sits on the peer-facing leg: the connect side on the client
    // instance, the accept side on the server instance. Accepting makes
    // us the handshake server; connecting out makes us the client.
    let local_session = (setup.secure && !setup.client).then(|| new_session(ssh::Role::Server));
    let remote_session = (setup.secure && setup.client).then(|| new_session(ssh::Role::Client));

    // ── request chain, head to tail ──
    let mut req_decrypt = None;
    if let Some(session) = &local_session {
        req_decrypt = Some(request.push(Box::new(DecryptFilter::new(
            session.clone(),
            setup.local.cache.is_some(),
        ))));
    }
    if setup.local.counting {
        request.push(Box::new(CountFilter::new(
            setup.local.counts.request_input.clone(),
        )));
    }
    if setup.local.compressor.is_some() {
        request.push(Box::new(InflateFilter::new()));
    }
    let mut req_decode = None;
    if let Some(cache) = &setup.local.cache {
        req_decode = Some(request.push(Box::new(DecodeFilter::new(
            resolver.clone(),
            cache.clone(),
        ))));
    }
    if setup.local.counting {
        request.push(Box::new(CountFilter::new(
            setup.local.counts.request_output.clone(),
        )));
    }
    if setup.remote.counting {
        request.push(Box::new(CountFilter::new(
            setup.remote.counts.request_input.clone(),
        )));
    }
    let mut req_encode = None;
    if let Some(cache) = &setup.remote.cache {
        req_encode = Some(request.push(Box::new(EncodeFilter::new(cache.clone()))));
    }
    if let Some(level) = setup.remote.compressor {
        request.push(Box::new(DeflateFilter::new(level)));
    }
    if setup.remote.counting {
        request.push(Box::new(CountFilter::new(
            setup.remote.counts.request_output.clone(),
        )));
    }
    let mut req_encrypt = None;
    if let Some(session) = &remote_session {
        req_encrypt = Some(request.push(Box::new(EncryptFilter::new(
            session.clone(),
            setup.remote.cache.is_some(),
        ))));
    }

    // ── response chain, head to tail ──
    let mut resp_decrypt = None;
    if let Some(session) = &remote_session {
        resp_decrypt = Some(response.push(Box::new(DecryptFilter::new(
            session.clone(),
            setup.remote.cache.is_some(),
        ))));
    }
    if setup.remote.counting {
        response.push(Box::new(CountFilter::new(
            setup.remote.counts.response_input.clone(),
        )));
    }
    if setup.remote.compressor.is_some() {
        response.push(Box::new(InflateFilter::new()));
    }
    let mut resp_decode = None;
    if let Some(cache) = &setup.remote.cache {
        resp_decode = Some(response.push(Box::new(DecodeFilter::new(
            resolver.clone(),
            cache.clone(),
        ))));
    }
    if setup.remote.counting {
        response.push(Box::new(CountFilter::new(
            setup.remote.counts.response_output.clone(),
        )));
    }
    if setup.local.counting {
        let counter = setup.local.counts.response_input.clone();
        response.push(Box::new(if setup.local.detect_http {
            CountFilter::with_http_detection(counter)
        } else {
            CountFilter::new(counter)
        }));
    }
    let mut resp_encode = None;
    if let Some(cache) = &setup.local.cache {
        resp_encode = Some(response.push(Box::new(EncodeFilter::new(cache.clone()))));
    }
    if let Some(level) = setup.local.compressor {
        response.push(Box::new(DeflateFilter::new(level)));
    }
    if setup.local.counting {
        response.push(Box::new(CountFilter::new(
            setup.local.counts.response_output.clone(),
        )));
    }
    let mut resp_encrypt = None;
    if let Some(session) = &local_session {
        resp_encrypt = Some(response.push(Box::new(EncryptFilter::new(
            session.clone(),
            setup.local.cache.is_some(),
        ))));
    }

    // ── cross-links: control traffic rides the opposite chain ──
    if let (Some(dec), Some(enc)) = (req_decode, resp_encode) {
        request.link_peer(dec, enc);
    }
    if let (Some(dec), Some(enc)) = (resp_decode, req_encode) {
        response.link_peer(dec, enc);
    }
    if let (Some(dec), Some(enc)) = (req_decrypt, resp_encrypt) {
        request.link_peer(dec, enc);
    }
    if let (Some(dec), Some(enc)) = (resp_decrypt, req_encrypt) {
        response.link_peer(dec, enc);
    }

    (request, response)
}

struct Pump {
    request: FilterChain,
    response: FilterChain,
    local_write: OwnedWriteHalf,
    remote_write: OwnedWriteHalf,
    ready: Flags,
    request_flushing: bool,
    response_flushing: bool,
}

impl Pump {
    /// Run one job and cascade peer operations between the chains until
    /// everything settles, writing chain output as it appears.
    async fn process(&mut self, dir: Dir, job: Job) -> Result<()> {
        let mut jobs: VecDeque<(Dir, Job)> = VecDeque::new();
        jobs.push_back((dir, job));

        while let Some((dir, job)) = jobs.pop_front() {
            let chain = match dir {
                Dir::Request => &mut self.request,
                Dir::Response => &mut self.response,
            };
            let run = match job {
                Job::Consume(buf) => chain.consume(buf, 0)?,
                Job::Flush(flags) => chain.flush(flags)?,
                Job::Inject(index, op) => chain.inject(index, op)?,
            };
            self.deliver(dir, run, &mut jobs).await?;
        }
        Ok(())
    }

    async fn deliver(
        &mut self,
        dir: Dir,
        run: ChainRun,
        jobs: &mut VecDeque<(Dir, Job)>,
    ) -> Result<()> {
        for (index, op) in run.peer_ops {
            jobs.push_back((dir.other(), Job::Inject(index, op)));
        }

        if !run.output.is_empty() {
            match dir {
                Dir::Request => self
                    .remote_write
                    .write_all(&run.output)
                    .await
                    .context("write to remote")?,
                Dir::Response => self
                    .local_write
                    .write_all(&run.output)
                    .await
                    .context("write to client")?,
            }
        }

        // A flush passing a chain's tail half-closes that direction once
        // its pending bytes are on the wire.
        if run.flushed {
            match dir {
                Dir::Request => {
                    if self.ready & REQUEST_CHAIN_READY == 0 {
                        tracing::debug!("request direction drained, half-closing remote");
                        let _ = self.remote_write.shutdown().await;
                        self.ready |= REQUEST_CHAIN_READY;
                    }
                }
                Dir::Response => {
                    if self.ready & RESPONSE_CHAIN_READY == 0 {
                        tracing::debug!("response direction drained, half-closing client");
                        let _ = self.local_write.shutdown().await;
                        self.ready |= RESPONSE_CHAIN_READY;
                    }
                }
            }
        }
        Ok(())
    }

    fn done(&self) -> bool {
        self.ready & (REQUEST_CHAIN_READY | RESPONSE_CHAIN_READY)
            == (REQUEST_CHAIN_READY | RESPONSE_CHAIN_READY)
    }
}

async fn pump(
    setup: &ConnectorSetup,
    local: TcpStream,
    remote: TcpStream,
    stop: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let (request, response) = build_chains(setup);
    let (mut local_read, local_write) = local.into_split();
    let (mut remote_read, remote_write) = remote.into_split();

    let mut pump = Pump {
        request,
        response,
        local_write,
        remote_write,
        ready: 0,
        request_flushing: false,
        response_flushing: false,
    };

    // Filters that speak first (the SSH pair) get their say before any
    // socket data flows.
    let opening = pump.request.start()?;
    pump.deliver(Dir::Request, opening, &mut VecDeque::new()).await?;
    let opening = pump.response.start()?;
    pump.deliver(Dir::Response, opening, &mut VecDeque::new()).await?;

    while !pump.done() {
        let mut local_buf = BytesMut::with_capacity(READ_CHUNK);
        let mut remote_buf = BytesMut::with_capacity(READ_CHUNK);

        tokio::select! {
            read = local_read.read_buf(&mut local_buf), if !pump.request_flushing => match read {
                Ok(0) => {
                    pump.request_flushing = true;
                    pump.process(Dir::Request, Job::Flush(REQUEST_CHAIN_READY)).await?;
                }
                Ok(_) => pump.process(Dir::Request, Job::Consume(local_buf)).await?,
                Err(e) => return Err(e).context("read from client"),
            },

            read = remote_read.read_buf(&mut remote_buf), if !pump.response_flushing => match read {
                Ok(0) => {
                    pump.response_flushing = true;
                    pump.process(Dir::Response, Job::Flush(RESPONSE_CHAIN_READY)).await?;
                }
                Ok(_) => pump.process(Dir::Response, Job::Consume(remote_buf)).await?,
                Err(e) => return Err(e).context("read from remote"),
            },

            _ = stop.recv() => {
                tracing::debug!("stop interest raised, closing connection");
                return Ok(());
            }
        }
    }

    Ok(())
}
