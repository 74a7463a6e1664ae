use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::accept::{
    report, AcceptError, AcceptServer, Acceptor, BoxConn, BoxError, ConnHandler,
};
use crate::addr::Endpoint;
use crate::commands::{command_names, command_table, BuildInfo, Command, CommandContext, ReleaseSource};
use crate::registry::TunnelRegistry;
use crate::resp::{Decoder, Encoder, Reply, RespError};
use crate::stats;
use crate::stats::MetricSink;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,
    #[error("server closed")]
    Closed,
    #[error("command is empty")]
    EmptyCommand,
    #[error("decode request error: {0}")]
    Decode(#[source] RespError),
    #[error("encode response error: {0}")]
    Encode(#[source] io::Error),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("listen error: {0}")]
    Listen(#[source] io::Error),
    #[error("server accept error: {0}")]
    Accept(#[source] AcceptError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Started,
    Closed,
}

/// The control server: accepts GUI connections on the configured loopback
/// endpoint and answers RESP commands that drive the tunnel registry.
pub struct Server {
    addr: Endpoint,
    registry: Arc<TunnelRegistry>,
    dispatcher: Arc<Dispatcher>,
    server: AcceptServer,
    state: Mutex<State>,
}

impl Server {
    pub fn new(
        addr: Endpoint,
        write_timeout: Duration,
        registry: Arc<TunnelRegistry>,
        build: BuildInfo,
        stats: Option<Arc<dyn MetricSink>>,
        releases: Arc<dyn ReleaseSource>,
        err_tx: Option<mpsc::Sender<BoxError>>,
    ) -> Self {
        let commands = command_table();
        let ctx = CommandContext {
            registry: Arc::clone(&registry),
            build,
            stats: stats.clone(),
            releases,
            command_names: command_names(&commands),
        };

        Self {
            addr,
            registry,
            dispatcher: Arc::new(Dispatcher {
                commands,
                ctx,
                write_timeout,
                err_tx: err_tx.clone(),
                stats,
            }),
            // the control server never idles itself away
            server: AcceptServer::new(Duration::ZERO, err_tx),
            state: Mutex::new(State::Fresh),
        }
    }

    /// Binds the control endpoint and serves it. Blocking; always resolves
    /// to the terminating error.
    pub async fn listen_and_serve(&self, stop: CancellationToken) -> ServerError {
        let listener = match TcpListener::bind((self.addr.host.as_str(), self.addr.port)).await {
            Ok(listener) => listener,
            Err(e) => return ServerError::Listen(e),
        };
        log::info!("culvert listening on {}", self.addr);
        self.serve(stop, Box::new(listener)).await
    }

    /// Serves control connections from `acceptor` until the stop token
    /// fires or accepting fails; every tunnel is torn down before this
    /// resolves.
    pub async fn serve(&self, stop: CancellationToken, acceptor: Box<dyn Acceptor>) -> ServerError {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                State::Fresh => *state = State::Started,
                State::Started => return ServerError::AlreadyStarted,
                State::Closed => return ServerError::Closed,
            }
        }

        let err = self
            .server
            .serve(stop, acceptor, Arc::clone(&self.dispatcher) as Arc<dyn ConnHandler>)
            .await;

        self.registry.shutdown().await;
        *self.state.lock().unwrap() = State::Closed;
        ServerError::Accept(err)
    }
}

/// Per-connection request loop: decode one request, run the command,
/// encode the reply, repeat until the connection or the server goes away.
struct Dispatcher {
    commands: HashMap<&'static str, Box<dyn Command>>,
    ctx: CommandContext,
    write_timeout: Duration,
    err_tx: Option<mpsc::Sender<BoxError>>,
    stats: Option<Arc<dyn MetricSink>>,
}

#[async_trait]
impl ConnHandler for Dispatcher {
    async fn handle(&self, stop: CancellationToken, conn: BoxConn) {
        let (read_half, write_half) = tokio::io::split(conn);
        let mut decoder = Decoder::new(read_half);
        let mut encoder = Encoder::new(write_half);

        loop {
            let request = tokio::select! {
                res = decoder.decode_request() => res,
                _ = stop.cancelled() => return,
            };
            let request = match request {
                Ok(request) => request,
                Err(RespError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    log::debug!("control connection closed");
                    return;
                }
                Err(e) => {
                    report(ServerError::Decode(e), &self.err_tx);
                    return;
                }
            };

            let reply = match self.execute(request).await {
                Ok(reply) => reply,
                Err(e) => {
                    report(e, &self.err_tx);
                    return;
                }
            };

            if let Err(e) = self.write_reply(&mut encoder, &reply).await {
                report(e, &self.err_tx);
                return;
            }
        }
    }
}

impl Dispatcher {
    async fn write_reply<W: tokio::io::AsyncWrite + Unpin>(
        &self,
        encoder: &mut Encoder<W>,
        reply: &Reply,
    ) -> Result<(), ServerError> {
        if self.write_timeout.is_zero() {
            return encoder.encode(reply).await.map_err(ServerError::Encode);
        }
        match tokio::time::timeout(self.write_timeout, encoder.encode(reply)).await {
            Ok(res) => res.map_err(ServerError::Encode),
            Err(_) => Err(ServerError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn execute(&self, request: Vec<String>) -> Result<Reply, ServerError> {
        stats::add(&self.stats, "commands_executed", 1);
        stats::add(&self.stats, "commands_inprogress", 1);
        let result = self.dispatch(request).await;
        stats::add(&self.stats, "commands_inprogress", -1);
        result
    }

    async fn dispatch(&self, request: Vec<String>) -> Result<Reply, ServerError> {
        let Some(first) = request.first() else {
            return Err(ServerError::EmptyCommand);
        };
        let name = first.to_lowercase();
        match self.commands.get(name.as_str()) {
            Some(command) => command.execute(&name, &request, &self.ctx).await,
            None => Ok(Reply::Error(format!("ERR unknown command {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use crate::resp::Value;
    use crate::ssh::{MetaConfig, SshError};
    use crate::testutil::{
        send_request, AcceptStep, MockBind, MockReleases, MockSshConnect, ScriptedAcceptor,
    };

    struct Harness {
        stop: CancellationToken,
        client: DuplexStream,
        connector: Arc<MockSshConnect>,
        serve: JoinHandle<ServerError>,
    }

    /// Starts a server with one scripted control connection and a mocked
    /// SSH/binder stack.
    fn start_server(tunnel_idle_timeout: Duration) -> Harness {
        let connector = Arc::new(MockSshConnect::new(|_| {
            Err(SshError::AuthRefused("unused".into()))
        }));
        let registry = Arc::new(TunnelRegistry::new(
            MetaConfig {
                known_hosts_file: PathBuf::from("/dev/null"),
                ssh_dial_timeout: Duration::from_secs(1),
            },
            Arc::clone(&connector) as Arc<dyn crate::ssh::SshConnect>,
            Arc::new(MockBind::blocking(8)),
            tunnel_idle_timeout,
            None,
            None,
            CancellationToken::new(),
        ));
        let server = Server::new(
            Endpoint::new("127.0.0.1", 7070),
            Duration::from_secs(1),
            registry,
            BuildInfo {
                version: "0.4.2",
                git_hash: "deadbeef",
            },
            None,
            Arc::new(MockReleases::tag("v9.9.9")),
            None,
        );

        let (near, far) = tokio::io::duplex(4096);
        let (acceptor, _accepts) = ScriptedAcceptor::new(vec![AcceptStep::Conn(Box::new(near))]);

        let stop = CancellationToken::new();
        let serve_stop = stop.clone();
        let serve =
            tokio::spawn(async move { server.serve(serve_stop, Box::new(acceptor)).await });

        Harness {
            stop,
            client: far,
            connector,
            serve,
        }
    }

    impl Harness {
        async fn shutdown(self) -> ServerError {
            self.stop.cancel();
            self.serve.await.unwrap()
        }
    }

    #[tokio::test]
    async fn ping_replies_with_the_literal_pong_bytes() {
        let mut harness = start_server(Duration::from_secs(1));

        harness.client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        harness.client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn command_lists_all_names_sorted() {
        let mut harness = start_server(Duration::from_secs(1));

        harness.client.write_all(b"*1\r\n$7\r\nCOMMAND\r\n").await.unwrap();
        let value = Decoder::new(&mut harness.client).decode().await.unwrap();

        let want: Vec<Value> = [
            "checkupdates",
            "command",
            "gettunneladdr",
            "info",
            "killtunnel",
            "ping",
        ]
        .iter()
        .map(|name| Value::Bulk(Some(name.to_string())))
        .collect();
        assert_eq!(value, Value::Array(Some(want)));

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_commands_keep_the_connection_open() {
        let mut harness = start_server(Duration::from_secs(1));

        harness.client.write_all(b"*1\r\n$4\r\nnope\r\n").await.unwrap();
        let value = Decoder::new(&mut harness.client).decode().await.unwrap();
        match value {
            Value::Error(msg) => assert!(msg.starts_with("ERR unknown command ")),
            other => panic!("want error reply, got {other:?}"),
        }

        // the connection still serves requests
        harness.client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        harness.client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");

        harness.shutdown().await;
    }

    async fn read_bulk(client: &mut DuplexStream) -> String {
        match Decoder::new(client).decode().await.unwrap() {
            Value::Bulk(Some(s)) => s,
            other => panic!("want bulk reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequential_tunnel_requests_reuse_one_tunnel() {
        let mut harness = start_server(Duration::from_secs(1));

        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let first = read_bulk(&mut harness.client).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let second = read_bulk(&mut harness.client).await;

        assert_eq!(first, second);
        assert_eq!(harness.connector.calls.connects.load(Ordering::SeqCst), 1);

        let connector = Arc::clone(&harness.connector);
        harness.shutdown().await;
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_tunnels_are_replaced_on_the_next_request() {
        let mut harness = start_server(Duration::from_millis(50));

        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let first = read_bulk(&mut harness.client).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let second = read_bulk(&mut harness.client).await;

        assert_ne!(first, second);

        let connector = Arc::clone(&harness.connector);
        harness.shutdown().await;
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn killtunnel_forces_a_new_address() {
        let mut harness = start_server(Duration::from_secs(1));

        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let first = read_bulk(&mut harness.client).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        // command names are matched case-insensitively
        send_request(
            &mut harness.client,
            &["killTUNNEL", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let mut buf = [0u8; 5];
        harness.client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+OK\r\n");

        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        let second = read_bulk(&mut harness.client).await;

        assert_ne!(first, second);

        let connector = Arc::clone(&harness.connector);
        harness.shutdown().await;
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_requests_terminate_the_connection() {
        let mut harness = start_server(Duration::from_secs(1));

        harness.client.write_all(b"$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(harness.client.read(&mut buf).await.unwrap(), 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn serve_twice_and_after_close_fail() {
        let connector = Arc::new(MockSshConnect::new(|_| {
            Err(SshError::AuthRefused("unused".into()))
        }));
        let registry = Arc::new(TunnelRegistry::new(
            MetaConfig {
                known_hosts_file: PathBuf::from("/dev/null"),
                ssh_dial_timeout: Duration::from_secs(1),
            },
            connector,
            Arc::new(MockBind::blocking(0)),
            Duration::from_secs(1),
            None,
            None,
            CancellationToken::new(),
        ));
        let server = Arc::new(Server::new(
            Endpoint::new("127.0.0.1", 7070),
            Duration::ZERO,
            registry,
            BuildInfo {
                version: "0.4.2",
                git_hash: "deadbeef",
            },
            None,
            Arc::new(MockReleases::none()),
            None,
        ));

        let stop = CancellationToken::new();
        let (acceptor, _accepts) = ScriptedAcceptor::new(vec![]);
        let serving = Arc::clone(&server);
        let serve_stop = stop.clone();
        let task =
            tokio::spawn(async move { serving.serve(serve_stop, Box::new(acceptor)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let (acceptor, _accepts) = ScriptedAcceptor::new(vec![]);
        let err = server.serve(stop.clone(), Box::new(acceptor)).await;
        assert!(matches!(err, ServerError::AlreadyStarted));

        stop.cancel();
        task.await.unwrap();

        let (acceptor, _accepts) = ScriptedAcceptor::new(vec![]);
        let err = server.serve(stop, Box::new(acceptor)).await;
        assert!(matches!(err, ServerError::Closed));
    }

    #[tokio::test]
    async fn server_shutdown_drains_live_tunnels() {
        let mut harness = start_server(Duration::from_secs(60));

        send_request(
            &mut harness.client,
            &["gettunneladdr", "root@127.0.0.1", "remote:7000"],
        )
        .await;
        read_bulk(&mut harness.client).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let connector = Arc::clone(&harness.connector);
        let err = harness.shutdown().await;
        assert!(matches!(err, ServerError::Accept(AcceptError::Stopped)));
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 1);
    }
}
