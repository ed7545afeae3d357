//! Signal Queue
//!
//! Serialisiert eingehende Offers, Answers und ICE Candidates in die
//! Peer Connection:
//! - Offer/Answer haben Vorrang vor Candidates, egal in welcher Reihenfolge
//!   sie ankommen
//! - Duplikate werden verworfen (Transport liefert at-least-once)
//! - Immer nur ein Signal gleichzeitig in Bearbeitung
//! - Fehlgeschlagene Signale werden nach kurzer Pause erneut versucht

use super::messages::{CallId, SignalEnvelope, SignalFingerprint, SignalKind};
use crate::call_engine::{PeerConnection, PeerError, SdpKind};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Meldung an die State Machine nach erfolgreicher Anwendung
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Applied { call_id: CallId, kind: SignalKind },
}

// ============================================================================
// SIGNAL HISTORY
// ============================================================================

/// Obergrenze der gemerkten Fingerprints pro Anruf
const HISTORY_LIMIT: usize = 512;

/// Fingerprints der bereits angewendeten Signale eines Anrufs
///
/// Jedes Offer, Answer und jeder Candidate bleibt gesperrt, auch nach
/// einer Renegotiation. Ein Offer mit neuem Inhalt wird angewendet.
#[derive(Debug, Clone, Default)]
pub struct SignalHistory {
    seen: HashSet<SignalFingerprint>,
    order: VecDeque<SignalFingerprint>,
    applied: usize,
}

impl SignalHistory {
    /// Wurde genau dieses Signal schon angewendet?
    pub fn contains(&self, signal: &SignalEnvelope) -> bool {
        self.seen.contains(&signal.fingerprint())
    }

    fn record(&mut self, signal: &SignalEnvelope) {
        let fingerprint = signal.fingerprint();
        if self.seen.insert(fingerprint) {
            self.order.push_back(fingerprint);
            if self.order.len() > HISTORY_LIMIT {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        self.applied += 1;
    }

    /// Anzahl der angewendeten Signale
    pub fn applied(&self) -> usize {
        self.applied
    }
}

// ============================================================================
// SIGNAL QUEUE
// ============================================================================

#[derive(Default)]
struct QueueState {
    pending: VecDeque<SignalEnvelope>,
    in_flight: Option<SignalFingerprint>,
    history: SignalHistory,
    target: Option<Arc<dyn PeerConnection>>,
    arrivals: u64,
    closed: bool,
    processing: bool,
    worker: Option<JoinHandle<()>>,
}

impl QueueState {
    fn is_duplicate(&self, signal: &SignalEnvelope) -> bool {
        let fingerprint = signal.fingerprint();
        self.in_flight == Some(fingerprint)
            || self.history.contains(signal)
            || self.pending.iter().any(|s| s.fingerprint() == fingerprint)
    }

    /// Nächstes Signal: erstes Offer/Answer, sonst ältester Candidate
    fn next(&mut self) -> Option<SignalEnvelope> {
        let index = self
            .pending
            .iter()
            .position(|s| s.kind.is_description())
            .unwrap_or(0);
        self.pending.remove(index)
    }
}

struct QueueInner {
    call_id: CallId,
    retry_delay: Duration,
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

/// Geordnete, deduplizierende Warteschlange für einen Anruf
pub struct SignalQueue {
    inner: Arc<QueueInner>,
}

impl SignalQueue {
    pub fn new(
        call_id: CallId,
        retry_delay: Duration,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                call_id,
                retry_delay,
                state: Mutex::new(QueueState::default()),
                events,
            }),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.inner.call_id
    }

    /// Reiht ein Signal ein. Ohne Peer Connection wird nur gepuffert.
    pub fn enqueue(&self, mut signal: SignalEnvelope) {
        let mut state = self.inner.state.lock();
        if state.closed {
            tracing::debug!("Queue for {} closed, dropping {:?}", self.inner.call_id, signal.kind);
            return;
        }

        if state.is_duplicate(&signal) {
            tracing::debug!("Dropping duplicate {:?} for {}", signal.kind, self.inner.call_id);
            return;
        }

        signal.sequence_hint = state.arrivals;
        state.arrivals += 1;
        state.pending.push_back(signal);

        Self::kick(&self.inner, &mut state);
    }

    /// Verbindet die Queue mit der Peer Connection und startet die Abarbeitung
    pub fn attach(&self, peer: Arc<dyn PeerConnection>) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.target = Some(peer);
        Self::kick(&self.inner, &mut state);
    }

    /// Stoppt die Abarbeitung und verwirft alles Ausstehende
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        state.target = None;
        state.pending.clear();
        state.in_flight = None;
        state.processing = false;
        if let Some(worker) = state.worker.take() {
            worker.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn history(&self) -> SignalHistory {
        self.inner.state.lock().history.clone()
    }

    fn kick(inner: &Arc<QueueInner>, state: &mut QueueState) {
        if state.processing || state.target.is_none() || state.pending.is_empty() {
            return;
        }
        state.processing = true;
        state.worker = Some(tokio::spawn(Self::process(Arc::clone(inner))));
    }

    async fn process(inner: Arc<QueueInner>) {
        loop {
            let (signal, target) = {
                let mut state = inner.state.lock();
                let Some(target) = state.target.clone() else {
                    state.processing = false;
                    return;
                };

                let signal = loop {
                    match state.next() {
                        None => {
                            state.processing = false;
                            return;
                        }
                        // Kann seit dem Einreihen angewendet worden sein
                        Some(s) if state.history.contains(&s) => continue,
                        Some(s) => break s,
                    }
                };
                state.in_flight = Some(signal.fingerprint());
                (signal, target)
            };

            match Self::apply(&*target, &signal).await {
                Ok(()) => {
                    tracing::debug!(
                        "Applied {:?} #{} for {}",
                        signal.kind,
                        signal.sequence_hint,
                        inner.call_id
                    );
                    {
                        let mut state = inner.state.lock();
                        state.in_flight = None;
                        state.history.record(&signal);
                    }
                    let _ = inner.events.send(QueueEvent::Applied {
                        call_id: inner.call_id.clone(),
                        kind: signal.kind,
                    });
                }
                Err(PeerError::InvalidSignal(reason)) => {
                    tracing::warn!(
                        "Dropping malformed {:?} for {}: {}",
                        signal.kind,
                        inner.call_id,
                        reason
                    );
                    inner.state.lock().in_flight = None;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to apply {:?} for {}, retrying in {:?}: {}",
                        signal.kind,
                        inner.call_id,
                        inner.retry_delay,
                        e
                    );
                    {
                        let mut state = inner.state.lock();
                        state.in_flight = None;
                        if state.closed {
                            return;
                        }
                        state.pending.push_front(signal);
                    }
                    tokio::time::sleep(inner.retry_delay).await;
                }
            }
        }
    }

    async fn apply(peer: &dyn PeerConnection, signal: &SignalEnvelope) -> Result<(), PeerError> {
        match signal.kind {
            SignalKind::Offer => {
                peer.set_remote_description(SdpKind::Offer, &signal.payload)
                    .await
            }
            SignalKind::Answer => {
                peer.set_remote_description(SdpKind::Answer, &signal.payload)
                    .await
            }
            SignalKind::IceCandidate => peer.add_ice_candidate(&signal.payload).await,
        }
    }
}

impl Drop for SignalQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SignalQueue")
            .field("call_id", &self.inner.call_id)
            .field("pending", &state.pending.len())
            .field("applied", &state.history.applied())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, MockPeer};

    fn queue() -> (SignalQueue, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SignalQueue::new(CallId::new("call-1"), Duration::from_secs(1), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn test_identical_offer_applied_once() {
        let (queue, _events) = queue();
        let peer = Arc::new(MockPeer::new());
        queue.attach(peer.clone());

        queue.enqueue(SignalEnvelope::offer("v=0 offer"));
        queue.enqueue(SignalEnvelope::offer("v=0 offer"));
        settle().await;
        queue.enqueue(SignalEnvelope::offer("v=0 offer"));
        settle().await;

        assert_eq!(peer.applied(), vec![(SignalKind::Offer, "v=0 offer".to_string())]);
    }

    #[tokio::test]
    async fn test_offer_before_candidates() {
        let (queue, mut events) = queue();
        let peer = Arc::new(MockPeer::new());

        // Gepuffert bis die Peer Connection da ist
        queue.enqueue(SignalEnvelope::ice_candidate("cand-1"));
        queue.enqueue(SignalEnvelope::ice_candidate("cand-2"));
        queue.enqueue(SignalEnvelope::offer("v=0 offer"));
        assert_eq!(queue.pending(), 3);

        queue.attach(peer.clone());
        settle().await;

        let kinds: Vec<_> = peer.applied().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            kinds,
            vec![SignalKind::Offer, SignalKind::IceCandidate, SignalKind::IceCandidate]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::Applied {
                call_id: CallId::new("call-1"),
                kind: SignalKind::Offer
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_candidates_suppressed() {
        let (queue, _events) = queue();
        let peer = Arc::new(MockPeer::new());
        queue.attach(peer.clone());

        queue.enqueue(SignalEnvelope::offer("v=0"));
        queue.enqueue(SignalEnvelope::ice_candidate("cand-1"));
        queue.enqueue(SignalEnvelope::ice_candidate("cand-1"));
        settle().await;
        queue.enqueue(SignalEnvelope::ice_candidate("cand-1"));
        settle().await;

        assert_eq!(peer.applied().len(), 2);
        assert_eq!(queue.history().applied(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_apply_is_retried_after_delay() {
        let (queue, _events) = queue();
        let peer = Arc::new(MockPeer::new());
        peer.fail_next_applies(1);
        queue.attach(peer.clone());

        queue.enqueue(SignalEnvelope::ice_candidate("early-candidate"));
        settle().await;
        assert!(peer.applied().is_empty());
        assert_eq!(queue.pending(), 1);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        settle().await;

        assert_eq!(peer.applied().len(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_malformed_signal_dropped() {
        let (queue, _events) = queue();
        let peer = Arc::new(MockPeer::new());
        queue.attach(peer.clone());

        queue.enqueue(SignalEnvelope::ice_candidate(MockPeer::MALFORMED));
        queue.enqueue(SignalEnvelope::ice_candidate("cand-ok"));
        settle().await;

        assert_eq!(
            peer.applied(),
            vec![(SignalKind::IceCandidate, "cand-ok".to_string())]
        );
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_new_offer_is_renegotiation() {
        let (queue, _events) = queue();
        let peer = Arc::new(MockPeer::new());
        queue.attach(peer.clone());

        queue.enqueue(SignalEnvelope::offer("v=0 first"));
        settle().await;
        queue.enqueue(SignalEnvelope::offer("v=0 second"));
        settle().await;
        queue.enqueue(SignalEnvelope::offer("v=0 second"));
        settle().await;

        assert_eq!(peer.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_offer_after_renegotiation() {
        let (queue, mut events) = queue();
        let peer = Arc::new(MockPeer::new());
        queue.attach(peer.clone());

        queue.enqueue(SignalEnvelope::offer("v=0 A"));
        settle().await;
        queue.enqueue(SignalEnvelope::offer("v=0 B"));
        settle().await;
        queue.enqueue(SignalEnvelope::offer("v=0 A"));
        settle().await;

        let offers: Vec<_> = peer
            .applied()
            .into_iter()
            .filter(|(k, _)| *k == SignalKind::Offer)
            .map(|(_, sdp)| sdp)
            .collect();
        assert_eq!(offers, vec!["v=0 A".to_string(), "v=0 B".to_string()]);
        assert_eq!(std::iter::from_fn(|| events.try_recv().ok()).count(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = SignalHistory::default();
        let first = SignalEnvelope::ice_candidate("cand-0");
        history.record(&first);
        for i in 1..=HISTORY_LIMIT {
            history.record(&SignalEnvelope::ice_candidate(format!("cand-{}", i)));
        }

        assert!(!history.contains(&first));
        assert!(history.contains(&SignalEnvelope::ice_candidate(format!("cand-{}", HISTORY_LIMIT))));
        assert_eq!(history.applied(), HISTORY_LIMIT + 1);
    }

    #[tokio::test]
    async fn test_closed_queue_drops_everything() {
        let (queue, _events) = queue();
        let peer = Arc::new(MockPeer::new());

        queue.enqueue(SignalEnvelope::offer("v=0"));
        queue.close();
        queue.attach(peer.clone());
        queue.enqueue(SignalEnvelope::answer("v=0 answer"));
        settle().await;

        assert!(peer.applied().is_empty());
        assert_eq!(queue.pending(), 0);
    }
}
