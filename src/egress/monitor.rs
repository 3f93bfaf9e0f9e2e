//! Transfer-monitoring stream wrapper
//!
//! Wraps a live egress connection and feeds read/write outcomes back into
//! the candidate pool: any completed transfer of n>0 bytes is evidence the
//! current path works, any I/O error is evidence it is broken. The wrapper
//! is observational only; byte counts and errors pass through verbatim.
//!
//! The pool is held through a `Weak` so a stream that outlives its dialer
//! never extends the pool's lifetime; reports are silently dropped once the
//! pool is gone.

use super::pool::Pool;
use parking_lot::RwLock;
use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub struct MonitoredStream<S> {
    inner: S,
    pool: Weak<RwLock<Pool>>,
}

impl<S> std::fmt::Debug for MonitoredStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredStream").finish_non_exhaustive()
    }
}

impl<S> MonitoredStream<S> {
    pub fn new(inner: S, pool: Weak<RwLock<Pool>>) -> Self {
        MonitoredStream { inner, pool }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn report_ok(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.write().on_transfer_ok();
        }
    }

    fn report_err(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.write().on_transfer_err();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MonitoredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() > before {
                    this.report_ok();
                }
            }
            Poll::Ready(Err(_)) => this.report_err(),
            Poll::Pending => {}
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MonitoredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        match &result {
            Poll::Ready(Ok(n)) => {
                if *n > 0 {
                    this.report_ok();
                }
            }
            Poll::Ready(Err(_)) => this.report_err(),
            Poll::Pending => {}
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
