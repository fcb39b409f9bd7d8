#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_jetty::acceptor;
use beach_jetty::control_plane::{MemoryControlPlane, SharedControlPlane};
use beach_jetty::engine::Clock;
use beach_jetty::RelayEngine;
use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub const GREETING: &str = "relay ready";

pub struct Relay {
    pub engine: Arc<RelayEngine>,
    pub memory: Arc<MemoryControlPlane>,
    pub control: SharedControlPlane,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl Relay {
    pub async fn start() -> Self {
        let memory = MemoryControlPlane::new();
        let control: SharedControlPlane = memory.clone();
        let engine = RelayEngine::new(Arc::clone(&control));
        Self::with_engine(engine, memory, control).await
    }

    pub async fn with_engine(
        engine: Arc<RelayEngine>,
        memory: Arc<MemoryControlPlane>,
        control: SharedControlPlane,
    ) -> Self {
        let listener = acceptor::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(acceptor::run(
            listener,
            Arc::clone(&engine),
            Arc::from(GREETING),
            shutdown.clone(),
        ));
        Self {
            engine,
            memory,
            control,
            addr,
            shutdown,
        }
    }

    /// Connects and waits for the greeting, by which point the connection
    /// is pending.
    pub async fn connect(&self) -> Peer {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let local = stream.local_addr().unwrap();
        let (reader, writer) = stream.into_split();
        let mut peer = Peer {
            local,
            lines: BufReader::new(reader).lines(),
            writer,
        };
        assert_eq!(peer.next_line().await.as_deref(), Some(GREETING));
        peer
    }
}

pub struct Peer {
    pub local: SocketAddr,
    pub lines: Lines<BufReader<OwnedReadHalf>>,
    pub writer: OwnedWriteHalf,
}

impl Peer {
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.next_line().await.unwrap()
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }
}

/// Command carried by a relayed frame.
pub fn frame_data(frame: &str) -> &str {
    frame
        .split_once(", Data: ")
        .map(|(_, data)| data)
        .unwrap_or_else(|| panic!("not a command frame: {frame}"))
}

/// Polls `check` until it holds; the test timeout bounds the wait.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    while !check().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
