//! The per-packet decision protocol for filter-mode sessions.
//!
//! Every packet crossing the fleet lands in [`SessionFilter::allow`]:
//! the packet is forwarded to the operator with a fresh sequence number
//! and the decision awaits a `Filter` request resolving that sequence,
//! bounded by the session's filter timeout. Injected packets are shown
//! to the operator but never held back, and a session that stops
//! answering degrades to its default action rather than stalling the
//! pipeline.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use ezproxy_wire::{Envelope, STATUS_TIMEOUT};
use tracing::{debug, warn};

use super::{packet_record, FilterVerdict, SessionShared};
use crate::spawner::{FanoutRecord, PacketFilter};

/// The filter callback a filter-mode session installs on the spawner.
pub(crate) struct SessionFilter {
    shared: Arc<SessionShared>,
}

impl SessionFilter {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl PacketFilter for SessionFilter {
    async fn allow(&self, pkt: &FanoutRecord) -> bool {
        self.shared.decide(pkt).await
    }
}

impl SessionShared {
    /// Decide one packet. Returns the drop/allow vote for the spawner.
    pub(crate) async fn decide(&self, pkt: &FanoutRecord) -> bool {
        if !self.matches_network(pkt.network) {
            // Out-of-scope networks never reach the operator.
            return self.default_allows();
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let filterable = !pkt.flags.is_injected();
        if filterable {
            self.filter_map
                .lock()
                .unwrap()
                .insert(seq, FilterVerdict::Wait);
        }

        // Offer, never block: a stalled operator must not stall dispatch.
        let envelope = Envelope::packet(packet_record(seq, pkt));
        if let Err(e) = self.outbound.try_send(envelope) {
            warn!(seq, error = %e, "failed to forward packet to operator");
            if filterable {
                self.filter_map.lock().unwrap().remove(&seq);
            }
            return self.default_allows();
        }
        if !filterable {
            // Injected packets are observed but always allowed.
            return true;
        }

        let deadline = tokio::time::Instant::now() + self.filter_timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the map so a decision landing
            // in between cannot be missed.
            notified.as_mut().enable();

            match self.filter_map.lock().unwrap().get(&seq) {
                Some(FilterVerdict::Allow) => {
                    debug!(seq, "operator allowed packet");
                    return true;
                }
                Some(FilterVerdict::Drop) => {
                    debug!(seq, "operator dropped packet");
                    return false;
                }
                _ => {}
            }

            tokio::select! {
                _ = self.scope.cancelled() => {
                    self.seal(seq);
                    return self.default_allows();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(seq, "packet decision timed out");
                    // Best effort, same non-blocking rule as the packet itself.
                    let _ = self
                        .outbound
                        .try_send(Envelope::error(STATUS_TIMEOUT, "packet timed out"));
                    self.seal(seq);
                    return self.default_allows();
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Record the default action as the packet's verdict, so a late
    /// operator decision gets "already handled" instead of racing a
    /// packet that is long gone.
    fn seal(&self, seq: i64) {
        let verdict = if self.default_allows() {
            FilterVerdict::Allow
        } else {
            FilterVerdict::Drop
        };
        self.filter_map.lock().unwrap().insert(seq, verdict);
    }
}
