use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::accept::{
    report, AcceptError, AcceptServer, Acceptor, BoxConn, BoxError, ConnHandler,
};
use crate::addr::Endpoint;
use crate::ssh::{SshClientConfig, SshConnect, SshError, SshSession};
use crate::stats;
use crate::stats::MetricSink;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("tunnel already started")]
    AlreadyStarted,
    #[error("tunnel closed")]
    Closed,
    #[error("ssh server dial error: {0}")]
    Dial(#[source] SshError),
    #[error("ssh remote dial error: {0}")]
    RemoteDial(#[source] SshError),
    #[error("copy bytes error: {0}")]
    Copy(#[source] std::io::Error),
    #[error("tunnel accept error: {0}")]
    Accept(#[source] AcceptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Serving,
    Closed,
}

/// An SSH tunnel: a loopback listener whose accepted connections are
/// forwarded to a fixed remote address through channels multiplexed over
/// one SSH session. The session is established when the tunnel starts
/// serving and closed exactly once when it shuts down.
pub struct Tunnel {
    /// The SSH server the session is established with.
    pub ssh: Endpoint,
    /// The remote address dialed through the session for every connection.
    pub remote: Endpoint,
    /// The loopback address the tunnel is exposed on.
    pub local: Endpoint,

    config: SshClientConfig,
    connector: Arc<dyn SshConnect>,
    err_tx: Option<mpsc::Sender<BoxError>>,
    stats: Option<Arc<dyn MetricSink>>,

    server: AcceptServer,
    kill: CancellationToken,
    killed: CancellationToken,
    state: Mutex<State>,
}

impl Tunnel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ssh: Endpoint,
        remote: Endpoint,
        local: Endpoint,
        config: SshClientConfig,
        connector: Arc<dyn SshConnect>,
        idle_timeout: Duration,
        err_tx: Option<mpsc::Sender<BoxError>>,
        stats: Option<Arc<dyn MetricSink>>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            ssh,
            remote,
            local,
            config,
            connector,
            err_tx: err_tx.clone(),
            stats,
            server: AcceptServer::new(idle_timeout, err_tx),
            kill,
            killed: CancellationToken::new(),
            state: Mutex::new(State::Fresh),
        }
    }

    /// Signals activity so the idle tracker keeps the tunnel alive.
    /// Returns whether the tunnel was serving when called.
    pub fn touch(&self) -> bool {
        if *self.state.lock().unwrap() != State::Serving {
            return false;
        }
        self.server.idle.touch();
        true
    }

    /// Serves the tunnel on `acceptor`. Blocks until the stop token fires
    /// or the accept loop fails, and always resolves to the terminating
    /// error. On exit the SSH session is closed, the state is Closed, and
    /// `kill_and_wait` callers are released.
    pub async fn serve(&self, stop: CancellationToken, acceptor: Box<dyn Acceptor>) -> TunnelError {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Fresh => *state = State::Serving,
                State::Serving => return TunnelError::AlreadyStarted,
                State::Closed => return TunnelError::Closed,
            }
        }

        stats::add(&self.stats, "active_tunnels", 1);
        stats::add(&self.stats, "total_tunnels", 1);

        let err = self.run(stop, acceptor).await;

        *self.state.lock().unwrap() = State::Closed;
        stats::add(&self.stats, "active_tunnels", -1);
        self.killed.cancel();
        err
    }

    async fn run(&self, stop: CancellationToken, acceptor: Box<dyn Acceptor>) -> TunnelError {
        let session: Arc<dyn SshSession> = match self.connector.connect(&self.ssh, &self.config).await
        {
            Ok(session) => Arc::from(session),
            Err(e) => return TunnelError::Dial(e),
        };

        let handler = Arc::new(Forwarder {
            session: Arc::clone(&session),
            remote: self.remote.clone(),
            err_tx: self.err_tx.clone(),
            stats: self.stats.clone(),
        });

        let err = self.server.serve(stop, acceptor, handler).await;

        // Every forwarder has joined by now, so the session can go down.
        if let Err(e) = session.close().await {
            report(e, &self.err_tx);
        }
        TunnelError::Accept(err)
    }

    /// Cancels the tunnel's stop token and blocks until teardown has
    /// completed. Safe to call from several tasks.
    pub async fn kill_and_wait(&self) {
        self.kill.cancel();
        self.killed.cancelled().await;
    }
}

/// Per-connection handler: opens a channel to the remote over the shared
/// SSH session and pipes bytes both ways until either side finishes or the
/// tunnel unwinds.
struct Forwarder {
    session: Arc<dyn SshSession>,
    remote: Endpoint,
    err_tx: Option<mpsc::Sender<BoxError>>,
    stats: Option<Arc<dyn MetricSink>>,
}

#[async_trait]
impl ConnHandler for Forwarder {
    async fn handle(&self, stop: CancellationToken, local: BoxConn) {
        stats::add(&self.stats, "active_tunnel_conns", 1);
        stats::add(&self.stats, "total_tunnel_conns", 1);
        self.forward(stop, local).await;
        stats::add(&self.stats, "active_tunnel_conns", -1);
    }
}

impl Forwarder {
    async fn forward(&self, stop: CancellationToken, local: BoxConn) {
        let conn_stop = stop.child_token();

        let remote = match self.session.dial(&self.remote).await {
            Ok(remote) => remote,
            Err(e) => {
                report(TunnelError::RemoteDial(e), &self.err_tx);
                return; // drops (closes) the local connection
            }
        };

        if stop.is_cancelled() {
            return; // stopped while connecting, drop both ends
        }

        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let mut copies = JoinSet::new();
        copies.spawn(copy_bytes(
            conn_stop.clone(),
            local_read,
            remote_write,
            self.err_tx.clone(),
        ));
        copies.spawn(copy_bytes(
            conn_stop.clone(),
            remote_read,
            local_write,
            self.err_tx.clone(),
        ));

        // Block until this connection is done: either copy direction
        // finishing, or the tunnel unwinding. Joining the copies before
        // returning keeps both streams alive until they have stopped.
        conn_stop.cancelled().await;
        while copies.join_next().await.is_some() {}
    }
}

/// One copy direction. Completion or failure of either direction cancels
/// the shared token so its twin stops too; a clean EOF is not an error.
async fn copy_bytes<R, W>(
    cancel: CancellationToken,
    mut src: R,
    mut dst: W,
    err_tx: Option<mpsc::Sender<BoxError>>,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    tokio::select! {
        res = tokio::io::copy(&mut src, &mut dst) => {
            if let Err(e) = res {
                report(TunnelError::Copy(e), &err_tx);
            }
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
