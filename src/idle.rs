use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::accept::BoxConn;

/// Tracks activity and cancels a token when a whole idle window elapses
/// without any. A counter rather than a timestamp keeps `touch` lock-free
/// and immune to clock adjustments; the polling worker only has to observe
/// change between two of its own ticks.
pub struct IdleTracker {
    timeout: Duration,
    current: Arc<AtomicU64>,
}

impl IdleTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            current: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Notifies the tracker of activity.
    pub fn touch(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawns the polling worker into `tasks`. Every idle window it compares
    /// the activity counter against its previous snapshot and fires `cancel`
    /// when nothing changed; the worker exits on `stop`. A zero timeout
    /// disables tracking entirely.
    pub fn start(&self, stop: CancellationToken, cancel: CancellationToken, tasks: &mut JoinSet<()>) {
        if self.timeout.is_zero() {
            return;
        }

        let timeout = self.timeout;
        let counter = Arc::clone(&self.current);
        tasks.spawn(async move {
            let mut previous = counter.load(Ordering::Relaxed);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        let current = counter.load(Ordering::Relaxed);
                        if current == previous {
                            cancel.cancel();
                            return;
                        }
                        previous = current;
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });
    }

    /// Wraps `conn` so reads and writes count as activity. Returns the
    /// connection unchanged when tracking is disabled.
    pub fn wrap(&self, conn: BoxConn) -> BoxConn {
        if self.timeout.is_zero() {
            return conn;
        }
        Box::new(ActivityConn {
            inner: conn,
            counter: Arc::clone(&self.current),
        })
    }
}

struct ActivityConn {
    inner: BoxConn,
    counter: Arc<AtomicU64>,
}

impl AsyncRead for ActivityConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.counter.fetch_add(1, Ordering::Relaxed);
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ActivityConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.counter.fetch_add(1, Ordering::Relaxed);
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
