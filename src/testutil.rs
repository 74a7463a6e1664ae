//! Test doubles shared by the module tests: scripted acceptors, in-memory
//! connections, and call-counting SSH mocks.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::accept::{Acceptor, BoxConn};
use crate::addr::Endpoint;
use crate::commands::{ReleaseSource, UpdateError};
use crate::registry::LocalBind;
use crate::ssh::{SshClientConfig, SshConnect, SshError, SshSession};

/// One step of a scripted acceptor.
pub enum AcceptStep {
    Conn(BoxConn),
    Err(io::Error),
}

/// Acceptor that replays scripted results, then blocks forever. The
/// returned counter records how many times accept was called, the blocked
/// final call included.
pub struct ScriptedAcceptor {
    steps: VecDeque<AcceptStep>,
    accepts: Arc<AtomicUsize>,
}

impl ScriptedAcceptor {
    pub fn new(steps: Vec<AcceptStep>) -> (Self, Arc<AtomicUsize>) {
        let accepts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                steps: VecDeque::from(steps),
                accepts: Arc::clone(&accepts),
            },
            accepts,
        )
    }
}

#[async_trait]
impl Acceptor for ScriptedAcceptor {
    async fn accept(&mut self) -> io::Result<BoxConn> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        match self.steps.pop_front() {
            Some(AcceptStep::Conn(conn)) => Ok(conn),
            Some(AcceptStep::Err(e)) => Err(e),
            None => std::future::pending().await,
        }
    }
}

/// Holds the far halves of connections handed out by test doubles, so the
/// near halves stay open until a test claims or drops them.
#[derive(Clone, Default)]
pub struct ConnPark {
    inner: Arc<Mutex<Vec<DuplexStream>>>,
}

impl ConnPark {
    /// Claims one parked connection, waiting for it to show up.
    pub async fn take_one(&self) -> DuplexStream {
        loop {
            if let Some(conn) = self.inner.lock().unwrap().pop() {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Returns a connection whose far half is parked, so reads block until a
/// test picks the far half up (or the park is dropped).
pub fn parked_conn(park: &ConnPark) -> BoxConn {
    let (near, far) = duplex(1024);
    park.inner.lock().unwrap().push(far);
    Box::new(near)
}

/// Call counts observed by the SSH doubles.
#[derive(Default)]
pub struct SshCalls {
    pub connects: AtomicUsize,
    pub dials: AtomicUsize,
    pub closes: AtomicUsize,
}

type DialFn = dyn Fn(usize) -> Result<BoxConn, SshError> + Send + Sync;

/// `SshConnect` double. Every produced session shares the same call
/// counters and dial behavior; `i` is the 0-based dial index.
pub struct MockSshConnect {
    pub calls: Arc<SshCalls>,
    dial_fn: Arc<DialFn>,
    connect_error: bool,
}

impl MockSshConnect {
    pub fn new(dial_fn: impl Fn(usize) -> Result<BoxConn, SshError> + Send + Sync + 'static) -> Self {
        Self {
            calls: Arc::new(SshCalls::default()),
            dial_fn: Arc::new(dial_fn),
            connect_error: false,
        }
    }

    /// A connector whose connect always fails.
    pub fn failing() -> Self {
        let mut connector = Self::new(|_| Err(SshError::AuthRefused("mock".into())));
        connector.connect_error = true;
        connector
    }
}

#[async_trait]
impl SshConnect for MockSshConnect {
    async fn connect(
        &self,
        _server: &Endpoint,
        _config: &SshClientConfig,
    ) -> Result<Box<dyn SshSession>, SshError> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_error {
            return Err(SshError::AuthRefused("mock".into()));
        }
        Ok(Box::new(MockSshSession {
            calls: Arc::clone(&self.calls),
            dial_fn: Arc::clone(&self.dial_fn),
        }))
    }
}

struct MockSshSession {
    calls: Arc<SshCalls>,
    dial_fn: Arc<DialFn>,
}

#[async_trait]
impl SshSession for MockSshSession {
    async fn dial(&self, _remote: &Endpoint) -> Result<BoxConn, SshError> {
        let i = self.calls.dials.fetch_add(1, Ordering::SeqCst);
        (self.dial_fn)(i)
    }

    async fn close(&self) -> Result<(), SshError> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// `LocalBind` double handing out blocking scripted acceptors on
/// predictable ports starting at 40001. Binding past the scripted count
/// fails, like an exhausted listen backlog would.
pub struct MockBind {
    remaining: AtomicUsize,
    next_port: AtomicUsize,
}

impl MockBind {
    pub fn blocking(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            next_port: AtomicUsize::new(40001),
        }
    }
}

#[async_trait]
impl LocalBind for MockBind {
    async fn bind(&self) -> io::Result<(Box<dyn Acceptor>, u16)> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(io::Error::other("no scripted listeners left"));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst) as u16;
        let (acceptor, _accepts) = ScriptedAcceptor::new(vec![]);
        Ok((Box::new(acceptor), port))
    }
}

/// `ReleaseSource` double with a fixed outcome.
pub struct MockReleases {
    result: Result<Option<String>, String>,
}

impl MockReleases {
    pub fn tag(tag: &str) -> Self {
        Self {
            result: Ok(Some(tag.to_string())),
        }
    }

    pub fn none() -> Self {
        Self { result: Ok(None) }
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            result: Err(msg.to_string()),
        }
    }
}

#[async_trait]
impl ReleaseSource for MockReleases {
    async fn latest_tag(&self) -> Result<Option<String>, UpdateError> {
        self.result.clone().map_err(UpdateError::Request)
    }
}

/// Writes one RESP request (array of bulk strings) to the stream.
pub async fn send_request<W: AsyncWrite + Unpin>(w: &mut W, args: &[&str]) {
    let mut buf = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
    }
    w.write_all(&buf).await.unwrap();
}
