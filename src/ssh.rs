use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::agent::client::AgentClient;
use russh::keys::check_known_hosts_path;
use russh::Disconnect;
use thiserror::Error;

use crate::accept::BoxConn;
use crate::addr::Endpoint;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("missing known hosts file")]
    NoKnownHostsFile,
    #[error("ssh dial timed out after {0:?}")]
    DialTimeout(Duration),
    #[error("ssh agent refused every identity for user {0:?}")]
    AuthRefused(String),
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("ssh key error: {0}")]
    Keys(#[from] russh::keys::Error),
    #[error("ssh agent error: {0}")]
    Agent(#[from] russh::AgentAuthError),
}

/// Client-side SSH settings for one tunnel, produced by
/// [`MetaConfig::with_agent`].
#[derive(Debug, Clone)]
pub struct SshClientConfig {
    pub user: String,
    pub known_hosts_file: PathBuf,
    pub dial_timeout: Duration,
}

/// Factory for per-user SSH client configurations.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    pub known_hosts_file: PathBuf,
    pub ssh_dial_timeout: Duration,
}

impl MetaConfig {
    /// Returns a client configuration for `user` that authenticates through
    /// the SSH agent. An empty user is passed through untouched.
    pub fn with_agent(&self, user: &str) -> Result<SshClientConfig, SshError> {
        if self.known_hosts_file.as_os_str().is_empty() {
            return Err(SshError::NoKnownHostsFile);
        }
        Ok(SshClientConfig {
            user: user.to_string(),
            known_hosts_file: self.known_hosts_file.clone(),
            dial_timeout: self.ssh_dial_timeout,
        })
    }
}

/// An established SSH session: the capability to open multiplexed channels
/// to remotes reachable from the server, and to shut the session down.
#[async_trait]
pub trait SshSession: Send + Sync {
    async fn dial(&self, remote: &Endpoint) -> Result<BoxConn, SshError>;
    async fn close(&self) -> Result<(), SshError>;
}

/// Establishes SSH sessions. Injected into tunnels so tests can substitute
/// a scripted implementation for the real client.
#[async_trait]
pub trait SshConnect: Send + Sync {
    async fn connect(
        &self,
        server: &Endpoint,
        config: &SshClientConfig,
    ) -> Result<Box<dyn SshSession>, SshError>;
}

/// [`SshConnect`] backed by russh: host keys are checked against the
/// configured known-hosts file and authentication goes through the agent
/// at `SSH_AUTH_SOCK`, trying each offered identity in turn.
pub struct RusshConnect;

struct HostKeyCheck {
    host: String,
    port: u16,
    known_hosts_file: PathBuf,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts_file,
        ) {
            Ok(known) => Ok(known),
            Err(e) => {
                log::warn!(
                    "host key verification failed for {}:{}: {}",
                    self.host,
                    self.port,
                    e
                );
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl SshConnect for RusshConnect {
    async fn connect(
        &self,
        server: &Endpoint,
        config: &SshClientConfig,
    ) -> Result<Box<dyn SshSession>, SshError> {
        let handler = HostKeyCheck {
            host: server.host.clone(),
            port: server.port,
            known_hosts_file: config.known_hosts_file.clone(),
        };
        let russh_config = Arc::new(client::Config::default());

        let user = config.user.clone();
        let host = server.host.clone();
        let port = server.port;
        let establish = async move {
            let mut handle = client::connect(russh_config, (host.as_str(), port), handler).await?;

            let mut agent = AgentClient::connect_env().await?;
            let identities = agent.request_identities().await?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

            for key in identities {
                let auth = handle
                    .authenticate_publickey_with(user.clone(), key, hash_alg, &mut agent)
                    .await?;
                if let client::AuthResult::Success = auth {
                    return Ok(handle);
                }
            }
            Err(SshError::AuthRefused(user))
        };

        let handle = if config.dial_timeout.is_zero() {
            establish.await?
        } else {
            tokio::time::timeout(config.dial_timeout, establish)
                .await
                .map_err(|_| SshError::DialTimeout(config.dial_timeout))??
        };

        Ok(Box::new(RusshSession { handle }))
    }
}

struct RusshSession {
    handle: client::Handle<HostKeyCheck>,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn dial(&self, remote: &Endpoint) -> Result<BoxConn, SshError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                remote.host.clone(),
                u32::from(remote.port),
                "127.0.0.1",
                0,
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<(), SshError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
