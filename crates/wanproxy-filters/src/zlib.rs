//! Zlib deflate/inflate as stream filters.
//!
//! Each consumed buffer ends with a sync flush so the peer can decompress
//! it without waiting for more input; `flush` finishes the stream. Data
//! errors are fatal for the connection.

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::chain::{Effects, Filter, Flags};
use crate::FilterError;

const CHUNK: usize = 16 * 1024;

pub struct DeflateFilter {
    stream: Compress,
}

impl DeflateFilter {
    pub fn new(level: u32) -> Self {
        Self {
            stream: Compress::new(Compression::new(level), true),
        }
    }

    fn run(&mut self, input: &[u8], flush: FlushCompress) -> Result<BytesMut, FilterError> {
        let finishing = matches!(flush, FlushCompress::Finish);
        let mut out = BytesMut::new();
        let mut consumed = 0usize;
        let mut buf = vec![0u8; CHUNK];
        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self.stream.compress(&input[consumed..], &mut buf, flush)?;
            consumed += (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;
            out.extend_from_slice(&buf[..produced]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if finishing {
                        // Keep going until StreamEnd; a full output buffer
                        // just means another pass.
                        if produced == 0 && consumed == input.len() {
                            break;
                        }
                    } else if consumed == input.len() && produced < buf.len() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Filter for DeflateFilter {
    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        let out = self.run(&buf, FlushCompress::Sync)?;
        fx.data(out, flags);
        Ok(())
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        let out = self.run(&[], FlushCompress::Finish)?;
        fx.data(out, 0);
        fx.forward_flush(flags);
        Ok(())
    }
}

pub struct InflateFilter {
    stream: Decompress,
}

impl InflateFilter {
    pub fn new() -> Self {
        Self {
            stream: Decompress::new(true),
        }
    }

    fn run(&mut self, input: &[u8], flush: FlushDecompress) -> Result<BytesMut, FilterError> {
        let mut out = BytesMut::new();
        let mut consumed = 0usize;
        let mut buf = vec![0u8; CHUNK];
        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();
            let status = self.stream.decompress(&input[consumed..], &mut buf, flush)?;
            consumed += (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;
            out.extend_from_slice(&buf[..produced]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if consumed == input.len() && produced == 0 {
                        break;
                    }
                    if consumed == input.len() && produced < buf.len() {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for InflateFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for InflateFilter {
    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        let out = self.run(&buf, FlushDecompress::Sync)?;
        fx.data(out, flags);
        Ok(())
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        let out = self.run(&[], FlushDecompress::Finish)?;
        fx.data(out, 0);
        fx.forward_flush(flags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FilterChain;

    #[test]
    fn deflate_then_inflate_round_trips() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(DeflateFilter::new(6)));
        chain.push(Box::new(InflateFilter::new()));

        let payload: Vec<u8> = b"compress me, compress me, compress me!"
            .iter()
            .copied()
            .cycle()
            .take(10_000)
            .collect();

        let run = chain.consume(BytesMut::from(&payload[..]), 0).unwrap();
        assert_eq!(&run.output[..], &payload[..], "sync flush must deliver everything");
    }

    #[test]
    fn each_buffer_is_decodable_alone() {
        // The sync flush means a decompressor never has to wait for the
        // next buffer to see this buffer's data.
        let mut deflate = DeflateFilter::new(9);
        let mut inflate = InflateFilter::new();

        for chunk in [&b"first chunk "[..], &b"second chunk"[..]] {
            let compressed = deflate.run(chunk, FlushCompress::Sync).unwrap();
            let plain = inflate.run(&compressed, FlushDecompress::Sync).unwrap();
            assert_eq!(&plain[..], chunk);
        }
    }

    #[test]
    fn flush_finishes_the_stream() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(DeflateFilter::new(1)));

        let first = chain.consume(BytesMut::from(&b"tail data"[..]), 0).unwrap();
        let done = chain.flush(0).unwrap();
        assert!(first.output.len() + done.output.len() > 0);
        assert!(done.flushed);

        // The concatenation of both outputs is a complete zlib stream.
        let mut inflate = InflateFilter::new();
        let mut whole = BytesMut::new();
        whole.extend_from_slice(&first.output);
        whole.extend_from_slice(&done.output);
        let plain = inflate.run(&whole, FlushDecompress::Finish).unwrap();
        assert_eq!(&plain[..], b"tail data");
    }

    #[test]
    fn corrupt_stream_is_fatal() {
        let mut chain = FilterChain::new();
        chain.push(Box::new(InflateFilter::new()));
        let garbage = BytesMut::from(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02][..]);
        assert!(chain.consume(garbage, 0).is_err());
    }
}
