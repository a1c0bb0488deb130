//! Newline-delimited JSON transport: one aggregated stream per TCP connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{future, SinkExt, StreamExt};
use keel_core::wire::{DiscoveryRequest, DiscoveryResponse};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::{DiscoveryServer, StreamMode};

/// Upper bound on one request or response line.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Accept connections until [`DiscoveryServer::shutdown`] is called, then give open streams
/// `grace` to finish before aborting them.
pub async fn serve_tcp(server: Arc<DiscoveryServer>, listener: TcpListener, grace: Duration) -> anyhow::Result<()> {
    let mut shutdown = server.shutdown_signal();
    let mut conns = JoinSet::new();
    info!(addr = ?listener.local_addr().ok(), "xds: listening");
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((sock, peer)) => {
                    let server = Arc::clone(&server);
                    conns.spawn(async move {
                        if let Err(e) = serve_conn(server, sock, peer).await {
                            debug!(%peer, error = %e, "xds: connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "xds: accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    info!(open = conns.len(), grace_ms = grace.as_millis() as u64, "xds: draining streams");
    let drained = tokio::time::timeout(grace, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(open = conns.len(), "xds: grace period elapsed; aborting streams");
        conns.abort_all();
        while conns.join_next().await.is_some() {}
    }
    info!("xds: stopped");
    Ok(())
}

async fn serve_conn(server: Arc<DiscoveryServer>, sock: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
    sock.set_nodelay(true).ok();
    let framed = Framed::new(sock, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let (mut sink, lines) = framed.split::<String>();
    let (tx, mut rx) = mpsc::channel::<DiscoveryResponse>(server.config().response_queue.max(1));
    debug!(%peer, "xds: connection accepted");

    // A framing error ends the stream; a malformed JSON line is skipped.
    let requests = lines
        .take_while(|line| future::ready(line.is_ok()))
        .filter_map(move |line| {
            future::ready(match line {
                Ok(l) if l.trim().is_empty() => None,
                Ok(l) => match serde_json::from_str::<DiscoveryRequest>(&l) {
                    Ok(req) => Some(req),
                    Err(e) => {
                        warn!(%peer, error = %e, "xds: malformed request line");
                        None
                    }
                },
                Err(_) => None,
            })
        });

    let writer = async move {
        while let Some(resp) = rx.recv().await {
            let line = serde_json::to_string(&resp).context("encode response")?;
            sink.send(line).await.context("write response")?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let (streamed, written) = tokio::join!(server.handle_stream(StreamMode::Aggregated, requests, tx), writer);
    written?;
    streamed?;
    Ok(())
}
