//! Ordered, typed data processors and the chain that owns them.
//!
//! A [`FilterChain`] owns its filters and wires them by index: a filter's
//! output items feed the next filter, and whatever passes the tail is the
//! chain's output. Flush travels the same path as data, so ordering
//! between a filter's last bytes and its end-of-stream is preserved.
//!
//! Filters that implement a paired protocol emit [`PeerOp`]s instead of
//! reaching into the opposite chain: the connection driver routes each op
//! to the linked filter index over there and runs that chain from that
//! point. This replaces shared mutable references between chains with
//! explicit, owned message passing.

use bytes::BytesMut;

use crate::FilterError;

pub type Flags = u32;

/// Chain-completion bits delivered through flush.
pub const REQUEST_CHAIN_READY: Flags = 1 << 0;
pub const RESPONSE_CHAIN_READY: Flags = 1 << 1;

/// Tag on data that is part of a counted HTTP body still in flight.
pub const TO_BE_CONTINUED: Flags = 1 << 2;

/// Signal flushes, delivered to a specific peer filter rather than a
/// whole chain: the SSH pair announces its key agreement, the dedup pair
/// acknowledges end of stream.
pub const ALGORITHM_NEGOTIATED: Flags = 1 << 3;
pub const EOS_ACK_FLUSH: Flags = 1 << 4;

/// Work travelling down a chain.
#[derive(Debug)]
pub enum Item {
    Data(BytesMut, Flags),
    Flush(Flags),
}

/// An operation aimed at the linked filter in the opposite chain.
#[derive(Debug)]
pub enum PeerOp {
    /// Run the peer filter's `produce` with these bytes, then continue
    /// down its chain.
    Produce(BytesMut),
    /// Deliver a signal flush to the peer filter.
    Flush(Flags),
}

/// Effects a filter emits while processing one item.
#[derive(Debug, Default)]
pub struct Effects {
    next: Vec<Item>,
    peer: Vec<PeerOp>,
}

impl Effects {
    /// Hand bytes to the next filter.
    pub fn data(&mut self, buf: BytesMut, flags: Flags) {
        if !buf.is_empty() {
            self.next.push(Item::Data(buf, flags));
        }
    }

    /// Propagate a flush to the next filter.
    pub fn forward_flush(&mut self, flags: Flags) {
        self.next.push(Item::Flush(flags));
    }

    pub fn peer_produce(&mut self, buf: BytesMut) {
        if !buf.is_empty() {
            self.peer.push(PeerOp::Produce(buf));
        }
    }

    pub fn peer_flush(&mut self, flags: Flags) {
        self.peer.push(PeerOp::Flush(flags));
    }
}

/// A pipeline stage transforming one byte stream into another.
pub trait Filter: Send {
    /// Called once before any data flows, for filters that must speak
    /// first (the SSH pair sends its version line here).
    fn start(&mut self, _fx: &mut Effects) -> Result<(), FilterError> {
        Ok(())
    }

    /// Ingest bytes from the previous filter.
    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError>;

    /// Inject bytes at this filter's output stage. The default hands them
    /// straight to the next filter; filters that frame their output (SSH
    /// encrypt) override this so injected peer traffic is framed too.
    fn produce(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        fx.data(buf, flags);
        Ok(())
    }

    /// End of input. A filter drains its internal state and propagates the
    /// flush; filters holding for their peer (SSH encrypt before key
    /// agreement, dedup encode before `EOS_ACK`) withhold propagation
    /// until the release signal arrives as a later flush.
    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError>;
}

/// Result of running a chain (or a peer injection into it).
#[derive(Debug, Default)]
pub struct ChainRun {
    /// Bytes that passed the tail, to be written to this chain's socket.
    pub output: BytesMut,
    /// Flush flags that passed the tail; non-zero once the whole chain
    /// has drained and the socket may be half-closed.
    pub completed: Flags,
    /// True if any flush reached the tail.
    pub flushed: bool,
    /// Operations for the opposite chain: `(peer filter index, op)`.
    pub peer_ops: Vec<(usize, PeerOp)>,
}

/// Where to start processing an injected item.
enum Entry {
    Consume,
    Produce,
    Flush,
}

pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
    /// local filter index -> linked filter index in the opposite chain.
    links: Vec<Option<usize>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Append a filter, returning its index.
    pub fn push(&mut self, filter: Box<dyn Filter>) -> usize {
        self.filters.push(filter);
        self.links.push(None);
        self.filters.len() - 1
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Link a local filter to its counterpart index in the opposite chain.
    pub fn link_peer(&mut self, local: usize, peer: usize) {
        self.links[local] = Some(peer);
    }

    /// Give every filter its chance to speak first.
    pub fn start(&mut self) -> Result<ChainRun, FilterError> {
        let mut run = ChainRun::default();
        for i in 0..self.filters.len() {
            let mut fx = Effects::default();
            self.filters[i].start(&mut fx)?;
            self.dispatch_effects(i, fx, &mut run)?;
        }
        Ok(run)
    }

    /// Feed a buffer into the head of the chain.
    pub fn consume(&mut self, buf: BytesMut, flags: Flags) -> Result<ChainRun, FilterError> {
        self.run_at(0, Item::Data(buf, flags), Entry::Consume)
    }

    /// Flush the chain from the head.
    pub fn flush(&mut self, flags: Flags) -> Result<ChainRun, FilterError> {
        self.run_at(0, Item::Flush(flags), Entry::Flush)
    }

    /// Run a peer operation against the linked filter at `index`.
    pub fn inject(&mut self, index: usize, op: PeerOp) -> Result<ChainRun, FilterError> {
        match op {
            PeerOp::Produce(buf) => self.run_at(index, Item::Data(buf, 0), Entry::Produce),
            PeerOp::Flush(flags) => self.run_at(index, Item::Flush(flags), Entry::Flush),
        }
    }

    fn run_at(&mut self, index: usize, item: Item, entry: Entry) -> Result<ChainRun, FilterError> {
        let mut run = ChainRun::default();
        let mut queue: Vec<(usize, Item)> = Vec::new();

        // The first dispatch may enter through consume, produce or flush;
        // everything after that is consume/flush down the line.
        if index >= self.filters.len() {
            Self::tail(&mut run, item);
            return Ok(run);
        }

        let mut fx = Effects::default();
        match (entry, item) {
            (Entry::Consume, Item::Data(buf, flags)) => {
                self.filters[index].consume(buf, flags, &mut fx)?
            }
            (Entry::Produce, Item::Data(buf, flags)) => {
                self.filters[index].produce(buf, flags, &mut fx)?
            }
            (_, Item::Flush(flags)) => self.filters[index].flush(flags, &mut fx)?,
            (Entry::Flush, Item::Data(buf, flags)) => {
                self.filters[index].consume(buf, flags, &mut fx)?
            }
        }
        self.queue_effects(index, fx, &mut run, &mut queue)?;

        while let Some((i, item)) = queue.pop() {
            if i >= self.filters.len() {
                Self::tail(&mut run, item);
                continue;
            }
            let mut fx = Effects::default();
            match item {
                Item::Data(buf, flags) => self.filters[i].consume(buf, flags, &mut fx)?,
                Item::Flush(flags) => self.filters[i].flush(flags, &mut fx)?,
            }
            self.queue_effects(i, fx, &mut run, &mut queue)?;
        }

        Ok(run)
    }

    fn tail(run: &mut ChainRun, item: Item) {
        match item {
            Item::Data(buf, _) => run.output.extend_from_slice(&buf),
            Item::Flush(flags) => {
                run.completed |= flags;
                run.flushed = true;
            }
        }
    }

    /// FIFO ordering: effects are pushed in reverse so `queue.pop()`
    /// yields them in emission order before anything queued earlier.
    fn queue_effects(
        &self,
        index: usize,
        fx: Effects,
        run: &mut ChainRun,
        queue: &mut Vec<(usize, Item)>,
    ) -> Result<(), FilterError> {
        for op in fx.peer {
            let peer = self.links[index].ok_or(FilterError::Pipe("peer op from unlinked filter"))?;
            run.peer_ops.push((peer, op));
        }
        for item in fx.next.into_iter().rev() {
            queue.push((index + 1, item));
        }
        Ok(())
    }

    fn dispatch_effects(
        &mut self,
        index: usize,
        fx: Effects,
        run: &mut ChainRun,
    ) -> Result<(), FilterError> {
        let mut queue: Vec<(usize, Item)> = Vec::new();
        self.queue_effects(index, fx, run, &mut queue)?;
        while let Some((i, item)) = queue.pop() {
            if i >= self.filters.len() {
                Self::tail(run, item);
                continue;
            }
            let mut fx = Effects::default();
            match item {
                Item::Data(buf, flags) => self.filters[i].consume(buf, flags, &mut fx)?,
                Item::Flush(flags) => self.filters[i].flush(flags, &mut fx)?,
            }
            self.queue_effects(i, fx, run, &mut queue)?;
        }
        Ok(())
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}
