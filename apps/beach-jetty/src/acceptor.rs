use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{PeerLine, PeerLineCodec};
use crate::engine::RelayEngine;
use crate::lifecycle::DisconnectReason;
use crate::transport::TransportHandle;

pub const DEFAULT_GREETING: &str = "Connected to Firebase RTDB Command Server";

/// Binding is the only fatal acceptor error.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind transport listener on {}", addr))
}

/// Accepts stream connections until `shutdown` fires, one worker task each.
pub async fn run(
    listener: TcpListener,
    engine: Arc<RelayEngine>,
    greeting: Arc<str>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "transport listener ready");
    }
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                counter!("jetty_connections_accepted_total", 1);
                let engine = Arc::clone(&engine);
                let greeting = Arc::clone(&greeting);
                tokio::spawn(async move {
                    handle_connection(stream, peer, engine, greeting).await;
                });
            }
            Err(err) => {
                error!(error = %err, "transport accept error");
            }
        }
    }
    debug!("transport acceptor stopped");
}

/// Lifetime of one peer stream: pending, then registered, then torn down.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<RelayEngine>,
    greeting: Arc<str>,
) {
    info!(%peer, "new transport connection");
    let (reader, writer) = stream.into_split();
    let (transport, outbound) = TransportHandle::new(peer);
    transport.spawn_writer(writer, outbound);
    let mut lines = FramedRead::new(reader, PeerLineCodec::new());

    let mut ticket = engine.enqueue(transport.clone());
    if let Err(err) = transport.send_line(&greeting) {
        warn!(%peer, error = %err, "failed to send greeting");
    }

    let promotion = tokio::select! {
        promotion = ticket.promoted() => promotion,
        _ = drain_until_closed(&mut lines, peer) => engine.abandon_pending(&mut ticket),
    };
    let Some(promotion) = promotion else {
        engine
            .disconnect(transport.id(), None, DisconnectReason::TransportClosed)
            .await;
        transport.close();
        info!(%peer, "connection closed before registration");
        return;
    };

    let identity = promotion.identity;
    let mut evicted = promotion.evicted;
    info!(%peer, %identity, "connection promoted to registered session");

    let reason = loop {
        tokio::select! {
            reason = &mut evicted => {
                break reason.unwrap_or(DisconnectReason::Shutdown);
            }
            line = lines.next() => match line {
                Some(Ok(PeerLine::Text(line))) => {
                    if !line.trim().is_empty() {
                        engine.report_output(Some(&identity), "", &line).await;
                    }
                }
                Some(Ok(PeerLine::Overlong)) => {
                    warn!(%peer, %identity, "dropped overlong line from peer");
                }
                None => break DisconnectReason::TransportClosed,
                Some(Err(err)) => {
                    debug!(%peer, %identity, error = %err, "transport read failed");
                    break DisconnectReason::TransportClosed;
                }
            },
        }
    };

    engine
        .disconnect(transport.id(), Some(&identity), reason)
        .await;
    transport.close();
    info!(%peer, %identity, reason = reason.as_str(), "connection closed");
}

/// Reads and discards whatever an unregistered peer sends until EOF.
async fn drain_until_closed<R>(lines: &mut FramedRead<R, PeerLineCodec>, peer: SocketAddr)
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next().await {
            Some(Ok(PeerLine::Text(line))) => {
                debug!(%peer, bytes = line.len(), "ignoring data from unregistered peer");
            }
            Some(Ok(PeerLine::Overlong)) => {
                debug!(%peer, "ignoring overlong line from unregistered peer");
            }
            None => return,
            Some(Err(err)) => {
                debug!(%peer, error = %err, "transport read failed before registration");
                return;
            }
        }
    }
}
