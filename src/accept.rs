use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::idle::IdleTracker;

/// Backoff applied to transient accept errors: starts at 5ms, doubles,
/// and never exceeds 1s. A successful accept resets it.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A bidirectional byte stream. Everything the daemon forwards or serves
/// moves through this one shape: TCP sockets, SSH channel streams, and the
/// in-memory pipes the tests use.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxConn = Box<dyn Conn>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reports the error on the sink without blocking; a full sink drops the
/// error. Without a sink the error is logged instead.
pub fn report(err: impl Into<BoxError>, sink: &Option<mpsc::Sender<BoxError>>) {
    let err = err.into();
    match sink {
        Some(tx) => {
            let _ = tx.try_send(err);
        }
        None => log::warn!("{err}"),
    }
}

/// Source of inbound connections for an [`AcceptServer`].
#[async_trait]
pub trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<BoxConn>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<BoxConn> {
        let (stream, _) = TcpListener::accept(self).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Serves one accepted connection. Implementations own the connection and
/// must observe `stop` so teardown stays prompt.
#[async_trait]
pub trait ConnHandler: Send + Sync {
    async fn handle(&self, stop: CancellationToken, conn: BoxConn);
}

/// Decides whether an accept error is worth retrying. Injected so callers
/// are not tied to one platform's error taxonomy.
pub trait ErrorClassifier: Send + Sync {
    fn is_transient(&self, err: &io::Error) -> bool;
}

/// Default classifier: descriptor exhaustion and aborted handshakes are
/// retriable, everything else is fatal.
pub struct OsErrorClassifier;

// ENFILE / EMFILE, same values on linux and macOS.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

impl ErrorClassifier for OsErrorClassifier {
    fn is_transient(&self, err: &io::Error) -> bool {
        if matches!(
            err.kind(),
            io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
        ) {
            return true;
        }
        matches!(err.raw_os_error(), Some(ENFILE) | Some(EMFILE))
    }
}

#[derive(Error, Debug)]
pub enum AcceptError {
    /// The supervisor observed its stop token.
    #[error("accept loop stopped")]
    Stopped,
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),
    /// Reported on the error sink while backing off; never returned.
    #[error("temporary accept error, retrying in {delay:?}: {source}")]
    Transient {
        delay: Duration,
        #[source]
        source: io::Error,
    },
}

/// The accept/retry/dispatch loop shared by the control server and every
/// tunnel: accepts connections, retries transient errors with capped
/// exponential backoff, hands each connection to the handler on its own
/// task, and optionally shuts itself down after an idle window.
pub struct AcceptServer {
    pub idle: IdleTracker,
    pub err_tx: Option<mpsc::Sender<BoxError>>,
    pub classifier: Arc<dyn ErrorClassifier>,
}

impl AcceptServer {
    pub fn new(idle_timeout: Duration, err_tx: Option<mpsc::Sender<BoxError>>) -> Self {
        Self {
            idle: IdleTracker::new(idle_timeout),
            err_tx,
            classifier: Arc::new(OsErrorClassifier),
        }
    }

    /// Accepts until the stop token fires or a fatal accept error occurs.
    /// Always resolves to the terminating error, after the listener is
    /// closed and every dispatched handler has finished.
    pub async fn serve(
        &self,
        stop: CancellationToken,
        mut acceptor: Box<dyn Acceptor>,
        handler: Arc<dyn ConnHandler>,
    ) -> AcceptError {
        // Child scope: lets the idle tracker and a fatal error unwind the
        // handlers without cancelling the caller's token.
        let stop = stop.child_token();
        let mut tasks = JoinSet::new();
        self.idle.start(stop.clone(), stop.clone(), &mut tasks);

        let mut delay = Duration::ZERO;
        let err = loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => break AcceptError::Stopped,
                res = acceptor.accept() => res,
            };

            match accepted {
                Ok(conn) => {
                    delay = Duration::ZERO;
                    self.idle.touch();
                    let conn = self.idle.wrap(conn);
                    let handler = Arc::clone(&handler);
                    let conn_stop = stop.clone();
                    tasks.spawn(async move { handler.handle(conn_stop, conn).await });
                }
                Err(e) => {
                    if stop.is_cancelled() {
                        break AcceptError::Accept(e);
                    }
                    if !self.classifier.is_transient(&e) {
                        break AcceptError::Accept(e);
                    }

                    delay = if delay.is_zero() {
                        INITIAL_RETRY_DELAY
                    } else {
                        (delay * 2).min(MAX_RETRY_DELAY)
                    };
                    report(AcceptError::Transient { delay, source: e }, &self.err_tx);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => break AcceptError::Stopped,
                    }
                }
            }
        };

        // Stop accepting, tell every handler to unwind, then join them all
        // so no handler outlives this call.
        drop(acceptor);
        stop.cancel();
        while tasks.join_next().await.is_some() {}
        err
    }
}
