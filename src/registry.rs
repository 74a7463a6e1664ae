use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::accept::{report, AcceptError, Acceptor, BoxError};
use crate::addr::Endpoint;
use crate::ssh::{MetaConfig, SshConnect, SshError};
use crate::stats::MetricSink;
use crate::tunnel::{Tunnel, TunnelError};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to prepare ssh configuration: {0}")]
    Config(#[from] SshError),
    #[error("failed to bind local listener: {0}")]
    Bind(#[from] io::Error),
}

/// Binds loopback listeners for new tunnels. Injected so tests can hand
/// out scripted acceptors with predictable ports.
#[async_trait]
pub trait LocalBind: Send + Sync {
    async fn bind(&self) -> io::Result<(Box<dyn Acceptor>, u16)>;
}

/// Binds `127.0.0.1:0` and reports the port the system picked.
pub struct TcpBind;

#[async_trait]
impl LocalBind for TcpBind {
    async fn bind(&self) -> io::Result<(Box<dyn Acceptor>, u16)> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        Ok((Box::new(listener), port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TunnelKey {
    user: String,
    ssh: Endpoint,
    remote: Endpoint,
}

/// Live tunnels keyed by (user, ssh server, remote). Lookups reuse a
/// tunnel whose `touch` succeeds and replace anything else; entries are
/// never removed by the tunnels themselves.
pub struct TunnelRegistry {
    meta: MetaConfig,
    connector: Arc<dyn SshConnect>,
    binder: Arc<dyn LocalBind>,
    tunnel_idle_timeout: Duration,
    err_tx: Option<mpsc::Sender<BoxError>>,
    stats: Option<Arc<dyn MetricSink>>,
    root: CancellationToken,
    tunnels: Mutex<HashMap<TunnelKey, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        meta: MetaConfig,
        connector: Arc<dyn SshConnect>,
        binder: Arc<dyn LocalBind>,
        tunnel_idle_timeout: Duration,
        err_tx: Option<mpsc::Sender<BoxError>>,
        stats: Option<Arc<dyn MetricSink>>,
        root: CancellationToken,
    ) -> Self {
        Self {
            meta,
            connector,
            binder,
            tunnel_idle_timeout,
            err_tx,
            stats,
            root,
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the loopback address serving the (user, ssh, remote) tunnel.
    /// A live tunnel is reused; a stale or missing one is replaced by a
    /// freshly launched tunnel on a system-chosen port.
    pub async fn tunnel_addr(
        &self,
        user: &str,
        ssh: Endpoint,
        remote: Endpoint,
    ) -> Result<Endpoint, RegistryError> {
        let key = TunnelKey {
            user: user.to_string(),
            ssh,
            remote,
        };

        let mut tunnels = self.tunnels.lock().await;

        if let Some(tun) = tunnels.get(&key) {
            if tun.touch() {
                return Ok(tun.local.clone());
            }
        }

        let config = self.meta.with_agent(user)?;
        let (acceptor, port) = self.binder.bind().await?;
        let local = Endpoint::new("127.0.0.1", port);

        let kill = self.root.child_token();
        let tun = Arc::new(Tunnel::new(
            key.ssh.clone(),
            key.remote.clone(),
            local.clone(),
            config,
            Arc::clone(&self.connector),
            self.tunnel_idle_timeout,
            self.err_tx.clone(),
            self.stats.clone(),
            kill.clone(),
        ));

        log::info!(
            "starting tunnel {} -> {} via {} (user {:?})",
            local,
            tun.remote,
            tun.ssh,
            key.user
        );
        tunnels.insert(key, Arc::clone(&tun));
        drop(tunnels);

        let err_tx = self.err_tx.clone();
        tokio::spawn(async move {
            match tun.serve(kill, acceptor).await {
                TunnelError::Accept(AcceptError::Stopped) => {
                    log::debug!("tunnel {} stopped", tun.local);
                }
                err => report(err, &err_tx),
            }
        });

        Ok(local)
    }

    /// Kills the tunnel for the key, blocking until its teardown is done.
    /// A missing tunnel is fine. The map entry stays; the next lookup
    /// observes the dead tunnel and replaces it.
    pub async fn kill_tunnel(&self, user: &str, ssh: Endpoint, remote: Endpoint) {
        let key = TunnelKey {
            user: user.to_string(),
            ssh,
            remote,
        };

        // Fetch the tunnel under the lock but kill it outside, so a
        // teardown path contending for the registry cannot deadlock.
        let tun = self.tunnels.lock().await.get(&key).cloned();
        if let Some(tun) = tun {
            log::info!("killing tunnel {}", tun.local);
            tun.kill_and_wait().await;
        }
    }

    /// Tears down every tunnel. Invoked when the control server unwinds.
    pub async fn shutdown(&self) {
        let snapshot: Vec<Arc<Tunnel>> = {
            let mut tunnels = self.tunnels.lock().await;
            tunnels.drain().map(|(_, tun)| tun).collect()
        };
        for tun in snapshot {
            tun.kill_and_wait().await;
        }
    }
}
