//! Per-stream push/ACK/NACK state machine.

use std::collections::BTreeMap;

use futures::{Stream, StreamExt};
use keel_core::wire::{DiscoveryRequest, DiscoveryResponse, NamedResource};
use keel_core::ResourceType;
use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DiscoveryServer, StreamMode, Subscriber};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("response channel closed")]
    Closed,
    #[error("type {got} requested on a stream scoped to {want}")]
    TypeMismatch { want: ResourceType, got: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Open,
    AwaitingAck,
}

#[derive(Debug)]
struct Pending {
    nonce: String,
    version: String,
}

#[derive(Debug, Default)]
struct WatchState {
    phase: Phase,
    pending: Option<Pending>,
    last_sent: Option<String>,
    not_before: Option<Instant>,
    /// NACKs since the last ACK on this watch; picks the backoff step.
    nack_streak: u64,
    names: Vec<String>,
}

struct StreamCtx {
    mode: StreamMode,
    subscriber: Option<Subscriber>,
    watches: BTreeMap<ResourceType, WatchState>,
    epochs: Option<watch::Receiver<u64>>,
}

impl StreamCtx {
    fn next_wake(&self) -> Option<Instant> {
        self.watches.values().filter_map(|w| w.not_before).min()
    }
}

async fn epoch_changed(rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl DiscoveryServer {
    /// Serve one subscriber stream until the subscriber goes away, the response channel
    /// closes or the server shuts down.
    pub async fn handle_stream<S>(
        &self,
        mode: StreamMode,
        requests: S,
        tx: mpsc::Sender<DiscoveryResponse>,
    ) -> Result<(), StreamError>
    where
        S: Stream<Item = DiscoveryRequest>,
    {
        futures::pin_mut!(requests);
        let mut shutdown = self.shutdown_signal();
        let mut ctx = StreamCtx { mode, subscriber: None, watches: BTreeMap::new(), epochs: None };
        increment_gauge!("xds_streams_active", 1.0);
        let res = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            let wake = ctx.next_wake();
            tokio::select! {
                maybe = requests.next() => match maybe {
                    Some(req) => {
                        if let Err(e) = self.on_request(&mut ctx, req) { break Err(e); }
                        if let Err(e) = self.push_due(&mut ctx, &tx).await { break Err(e); }
                    }
                    None => break Ok(()),
                },
                changed = epoch_changed(&mut ctx.epochs) => {
                    if !changed {
                        ctx.epochs = None;
                        continue;
                    }
                    if let Err(e) = self.push_due(&mut ctx, &tx).await { break Err(e); }
                },
                _ = sleep_until_opt(wake) => {
                    if let Err(e) = self.push_due(&mut ctx, &tx).await { break Err(e); }
                },
                _ = shutdown.changed() => break Ok(()),
            }
        };
        decrement_gauge!("xds_streams_active", 1.0);
        self.release(ctx);
        res
    }

    fn request_type(&self, mode: StreamMode, type_url: &str) -> Result<Option<ResourceType>, StreamError> {
        let wire = self.cache().wire_version();
        if type_url.is_empty() {
            return Ok(match mode {
                StreamMode::Typed(rt) => Some(rt),
                StreamMode::Aggregated => {
                    counter!("xds_unknown_type_total", 1u64);
                    None
                }
            });
        }
        let Some(rt) = wire.resource_type(type_url) else {
            counter!("xds_unknown_type_total", 1u64);
            return Ok(None);
        };
        match mode {
            StreamMode::Typed(want) if want != rt => Err(StreamError::TypeMismatch { want, got: type_url.to_string() }),
            _ => Ok(Some(rt)),
        }
    }

    fn on_request(&self, ctx: &mut StreamCtx, req: DiscoveryRequest) -> Result<(), StreamError> {
        let Some(rt) = self.request_type(ctx.mode, &req.type_url)? else {
            if req.type_url.is_empty() {
                warn!("stream: ignoring aggregated request without type_url");
            } else {
                warn!(type_url = %req.type_url, "stream: ignoring request for unknown type");
            }
            return Ok(());
        };
        if ctx.subscriber.is_none() {
            let sub = Subscriber::from_node(req.node.as_ref());
            info!(node = %sub.node_id, subscriber = %sub.instance, mode = ?ctx.mode, "stream: subscribed");
            ctx.epochs = Some(self.cache().subscribe(&sub.node_id));
            ctx.subscriber = Some(sub);
        }
        let Some(sub) = ctx.subscriber.as_ref() else { return Ok(()) };
        self.feedback().report_request(&sub.node_id, rt, &req.version_info, &sub.instance);

        let w = ctx.watches.entry(rt).or_default();
        w.names = req.resource_names;

        if req.response_nonce.is_empty() {
            if let Some(old) = w.pending.take() {
                self.feedback().abandon_pending_nonce(&sub.node_id, rt, &sub.instance, &old.nonce);
            }
            w.phase = Phase::Open;
            w.last_sent = None;
            return Ok(());
        }

        let answers_pending = w.pending.as_ref().map(|p| p.nonce == req.response_nonce).unwrap_or(false);
        if !answers_pending {
            debug!(node = %sub.node_id, rtype = %rt, nonce = %req.response_nonce, "stream: stale nonce ignored");
            return Ok(());
        }
        let Some(pending) = w.pending.take() else { return Ok(()) };
        let pushed = self
            .feedback()
            .take_pending_nonce(&sub.node_id, rt, &sub.instance, &pending.nonce)
            .unwrap_or(pending.version);
        w.phase = Phase::Open;

        match req.error_detail {
            None => {
                w.nack_streak = 0;
                self.feedback().report_ack(&sub.node_id, rt, &req.version_info, &sub.instance);
                debug!(node = %sub.node_id, rtype = %rt, version = %req.version_info, subscriber = %sub.instance, "stream: ack");
            }
            Some(detail) => {
                self.feedback().report_nack(&sub.node_id, rt, &pushed, &sub.instance);
                w.nack_streak += 1;
                let delay = self.config().backoff.delay(w.nack_streak - 1);
                w.not_before = Some(Instant::now() + delay);
                warn!(
                    node = %sub.node_id,
                    rtype = %rt,
                    version = %pushed,
                    subscriber = %sub.instance,
                    streak = w.nack_streak,
                    code = detail.code,
                    message = %detail.message,
                    delay_ms = delay.as_millis() as u64,
                    "stream: nack"
                );
            }
        }
        Ok(())
    }

    async fn push_due(&self, ctx: &mut StreamCtx, tx: &mpsc::Sender<DiscoveryResponse>) -> Result<(), StreamError> {
        let now = Instant::now();
        for w in ctx.watches.values_mut() {
            if w.not_before.map(|t| t <= now).unwrap_or(false) {
                w.not_before = None;
            }
        }
        let Some(sub) = ctx.subscriber.as_ref() else { return Ok(()) };
        let Ok(snap) = self.cache().get_snapshot(&sub.node_id) else { return Ok(()) };
        let wire = snap.wire_version();

        for (rt, w) in ctx.watches.iter_mut() {
            let Some(slot) = snap.slot(*rt) else { continue };
            if w.not_before.is_some() {
                continue;
            }
            let up_to_date = match (w.phase, w.pending.as_ref()) {
                (Phase::AwaitingAck, Some(p)) => p.version == slot.version,
                _ => w.last_sent.as_deref() == Some(slot.version.as_str()),
            };
            if up_to_date {
                continue;
            }
            if let Some(old) = w.pending.take() {
                self.feedback().abandon_pending_nonce(&sub.node_id, *rt, &sub.instance, &old.nonce);
                debug!(node = %sub.node_id, rtype = %rt, version = %old.version, "stream: pending push superseded");
            }

            let resources: Vec<NamedResource> = slot
                .items
                .iter()
                .filter(|(name, _)| w.names.is_empty() || w.names.iter().any(|n| n == *name))
                .map(|(name, v)| NamedResource { name: name.clone(), resource: v.clone() })
                .collect();
            let nonce = Uuid::new_v4().to_string();
            let resp = DiscoveryResponse {
                version_info: slot.version.clone(),
                resources,
                type_url: wire.type_url(*rt).unwrap_or_default().to_string(),
                nonce: nonce.clone(),
            };
            self.feedback().record_pending_nonce(&sub.node_id, *rt, &sub.instance, &nonce, &slot.version, self.config().nonce_ttl);
            let count = resp.resources.len();
            tx.send(resp).await.map_err(|_| StreamError::Closed)?;
            counter!("xds_pushes_total", 1u64, "type" => rt.as_str());
            debug!(node = %sub.node_id, rtype = %rt, version = %slot.version, resources = count, "stream: pushed");

            w.phase = Phase::AwaitingAck;
            w.pending = Some(Pending { nonce, version: slot.version.clone() });
            w.last_sent = Some(slot.version.clone());
        }
        Ok(())
    }

    fn release(&self, mut ctx: StreamCtx) {
        ctx.epochs = None;
        let Some(sub) = ctx.subscriber.as_ref() else { return };
        for (rt, w) in ctx.watches.iter() {
            if let Some(p) = w.pending.as_ref() {
                self.feedback().abandon_pending_nonce(&sub.node_id, *rt, &sub.instance, &p.nonce);
            }
        }
        self.cache().release(&sub.node_id);
        info!(node = %sub.node_id, subscriber = %sub.instance, "stream: closed");
    }
}
