//! Record-size scheme for traffic shaping
//!
//! A scheme is a small line-oriented table: a mandatory `stop=N` entry plus
//! per-packet-index entries listing size ranges, e.g.
//!
//! ```text
//! stop=5
//! 0=100-300
//! 1=50-200
//! 3=20-50,c
//! ```
//!
//! For packet indexes below `stop` the factory samples one size per listed
//! range; `c` yields a check mark that downstream framers treat as a cut
//! point. The server splits its first writes of each session into these
//! sizes so record lengths follow the scheme rather than the payload.

use crate::{Error, Result};
use rand::Rng;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const DEFAULT_SCHEME: &[u8] = b"stop=5
0=100-300
1=50-200
2=500-1500
3=20-50,c
4=200-1200";

/// One sampled record size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSize {
    Bytes(usize),
    /// Cut point marker (`c` in the scheme)
    Check,
}

/// Parsed record-size scheme
pub struct PaddingFactory {
    scheme: HashMap<String, String>,
    raw: Vec<u8>,
    stop: u32,
    digest: String,
}

impl PaddingFactory {
    /// Parse a raw scheme; fails when `stop` is missing or unparsable
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::parse("record-size scheme is not UTF-8"))?;

        let mut scheme = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                scheme.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        if scheme.is_empty() {
            return Err(Error::parse("empty record-size scheme"));
        }
        let stop: u32 = scheme
            .get("stop")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::parse("record-size scheme has no valid stop entry"))?;

        Ok(PaddingFactory {
            scheme,
            raw: raw.to_vec(),
            stop,
            digest: format!("{:x}", md5::compute(raw)),
        })
    }

    /// The built-in scheme
    pub fn default_scheme() -> Self {
        // the built-in table always parses
        Self::parse(DEFAULT_SCHEME).unwrap()
    }

    /// Packet index after which shaping stops
    pub fn stop(&self) -> u32 {
        self.stop
    }

    /// md5 hex digest of the raw scheme bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Raw scheme bytes as configured
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Sample the record sizes for packet index `pkt`
    pub fn record_sizes(&self, pkt: u32) -> Vec<RecordSize> {
        let mut sizes = Vec::new();
        let Some(entry) = self.scheme.get(&pkt.to_string()) else {
            return sizes;
        };

        let mut rng = rand::thread_rng();
        for range in entry.split(',') {
            if range == "c" {
                sizes.push(RecordSize::Check);
                continue;
            }
            let Some((lo, hi)) = range.split_once('-') else {
                continue;
            };
            let (Ok(lo), Ok(hi)) = (lo.parse::<i64>(), hi.parse::<i64>()) else {
                continue;
            };
            let (lo, hi) = (lo.min(hi), lo.max(hi));
            if lo <= 0 || hi <= 0 {
                continue;
            }
            let n = if lo == hi {
                lo
            } else {
                rng.gen_range(lo..hi)
            };
            sizes.push(RecordSize::Bytes(n as usize));
        }
        sizes
    }

    /// Flatten the scheme into a write plan for one session: the byte sizes
    /// of the first records to emit, in order.
    pub fn write_plan(&self) -> VecDeque<usize> {
        (0..self.stop)
            .flat_map(|pkt| self.record_sizes(pkt))
            .filter_map(|size| match size {
                RecordSize::Bytes(n) => Some(n),
                RecordSize::Check => None,
            })
            .collect()
    }
}

/// Stream wrapper that caps early writes to the scheme's record sizes.
///
/// Splitting a write changes record boundaries on the wire without altering
/// the byte stream; once the plan runs out, writes pass through untouched.
pub struct ShapedStream<S> {
    inner: S,
    plan: VecDeque<usize>,
}

impl<S> ShapedStream<S> {
    pub fn new(inner: S, plan: VecDeque<usize>) -> Self {
        ShapedStream { inner, plan }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShapedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShapedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let capped = match this.plan.front() {
            Some(&n) => &buf[..buf.len().min(n)],
            None => buf,
        };
        let result = Pin::new(&mut this.inner).poll_write(cx, capped);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 && !this.plan.is_empty() {
                this.plan.pop_front();
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_default_scheme_parses() {
        let factory = PaddingFactory::default_scheme();
        assert_eq!(factory.stop(), 5);
        assert_eq!(factory.digest().len(), 32);
    }

    #[test]
    fn test_digest_is_stable() {
        let a = PaddingFactory::parse(b"stop=2\n0=10-20").unwrap();
        let b = PaddingFactory::parse(b"stop=2\n0=10-20").unwrap();
        assert_eq!(a.digest(), b.digest());

        let c = PaddingFactory::parse(b"stop=2\n0=10-30").unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_rejects_missing_stop() {
        assert!(PaddingFactory::parse(b"0=100-200").is_err());
        assert!(PaddingFactory::parse(b"stop=abc\n0=1-2").is_err());
        assert!(PaddingFactory::parse(b"").is_err());
    }

    #[test]
    fn test_record_sizes_within_range() {
        let factory = PaddingFactory::parse(b"stop=1\n0=100-300").unwrap();
        for _ in 0..32 {
            let sizes = factory.record_sizes(0);
            assert_eq!(sizes.len(), 1);
            match sizes[0] {
                RecordSize::Bytes(n) => assert!((100..=300).contains(&n)),
                RecordSize::Check => panic!("unexpected check mark"),
            }
        }
    }

    #[test]
    fn test_record_sizes_fixed_and_check() {
        let factory = PaddingFactory::parse(b"stop=1\n0=50-50,c").unwrap();
        let sizes = factory.record_sizes(0);
        assert_eq!(sizes, vec![RecordSize::Bytes(50), RecordSize::Check]);
    }

    #[test]
    fn test_unknown_packet_index_is_empty() {
        let factory = PaddingFactory::parse(b"stop=1\n0=10-20").unwrap();
        assert!(factory.record_sizes(7).is_empty());
    }

    #[test]
    fn test_write_plan_skips_check_marks() {
        let factory = PaddingFactory::parse(b"stop=2\n0=10-10,c\n1=20-20").unwrap();
        let plan = factory.write_plan();
        assert_eq!(plan, VecDeque::from(vec![10, 20]));
    }

    #[tokio::test]
    async fn test_shaped_stream_splits_then_passes_through() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut shaped = ShapedStream::new(client, VecDeque::from(vec![3, 2]));

        let payload = b"abcdefghij";
        let mut written = 0;
        while written < payload.len() {
            written += shaped.write(&payload[written..]).await.unwrap();
        }

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, payload, "shaping must not alter the byte stream");
    }

    #[tokio::test]
    async fn test_shaped_stream_first_write_is_capped() {
        let (client, _server) = tokio::io::duplex(4096);
        let mut shaped = ShapedStream::new(client, VecDeque::from(vec![4]));
        let n = shaped.write(b"abcdefgh").await.unwrap();
        assert_eq!(n, 4);
        let n = shaped.write(b"efgh").await.unwrap();
        assert_eq!(n, 4, "plan exhausted, writes pass through");
    }
}
