//! Call-Zustände und Übergänge
//!
//! Die Übergangstabelle ist eine reine Funktion; der [`CallStore`] hält den
//! aktuellen Anruf und hat genau einen Schreiber (die State Machine).

use crate::signaling::CallId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Connecting,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallStatus::Connecting | CallStatus::Ringing | CallStatus::InProgress
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::Busy
                | CallStatus::NoAnswer
                | CallStatus::Canceled
        )
    }

    /// Zielzustand für `trigger`, `None` wenn der Übergang nicht erlaubt ist
    pub fn next(self, direction: CallDirection, trigger: CallTrigger) -> Option<CallStatus> {
        use CallDirection::{Incoming, Outgoing};
        use CallStatus::*;
        use CallTrigger as T;

        let next = match (self, direction, trigger) {
            (Idle, Outgoing, T::Start) => Connecting,
            (Idle, Incoming, T::IncomingInvite) => Ringing,

            (Connecting, Outgoing, T::RemoteRinging) => Ringing,

            (Connecting | Ringing, Outgoing, T::Accept) => InProgress,
            (Ringing, Incoming, T::Accept) => InProgress,

            (Ringing, _, T::Reject) => Completed,
            (Connecting, Outgoing, T::Reject) => Completed,

            (Ringing, Incoming, T::Timeout) => NoAnswer,
            (Connecting | Ringing, Outgoing, T::Timeout) => Canceled,
            (Connecting | Ringing, Outgoing, T::RemoteTimeout) => NoAnswer,

            (Connecting | Ringing | InProgress, _, T::RemoteHangup) => Completed,

            (InProgress, _, T::LocalEnd) => Completed,
            (Connecting | Ringing, Outgoing, T::LocalEnd) => Canceled,

            (Connecting | Ringing, Outgoing, T::RemoteBusy) => Busy,

            (Connecting | Ringing | InProgress, _, T::TransportError) => Failed,

            (s, _, T::Reset) if s.is_terminal() => Idle,

            _ => return None,
        };
        Some(next)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Auslöser eines Zustandsübergangs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTrigger {
    Start,
    IncomingInvite,
    RemoteRinging,
    Accept,
    Reject,
    Timeout,
    RemoteTimeout,
    RemoteHangup,
    LocalEnd,
    RemoteBusy,
    TransportError,
    Reset,
}

// ============================================================================
// CALL ATTEMPT
// ============================================================================

/// Ein Anrufversuch mit allen UI-relevanten Flags
#[derive(Debug, Clone, Serialize)]
pub struct CallAttempt {
    pub id: CallId,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub peer_id: String,
    /// Wird nachgeladen, zuerst die Peer-ID
    pub peer_display_name: String,
    pub video: bool,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub end_reason: Option<String>,
}

impl CallAttempt {
    pub fn new(id: CallId, direction: CallDirection, peer_id: &str, video: bool) -> Self {
        Self {
            id,
            direction,
            status: CallStatus::Idle,
            peer_id: peer_id.to_string(),
            peer_display_name: peer_id.to_string(),
            video,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            is_muted: false,
            is_video_enabled: video,
            is_screen_sharing: false,
            end_reason: None,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    /// Gesprächsdauer in Sekunden
    pub fn duration_secs(&self) -> Option<i64> {
        let answered = self.answered_at?;
        let ended = self.ended_at.unwrap_or_else(Utc::now);
        Some((ended - answered).num_seconds().max(0))
    }
}

/// Ergebnis eines erfolgreichen Übergangs
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: CallStatus,
    pub to: CallStatus,
    pub attempt: CallAttempt,
}

// ============================================================================
// CALL STORE
// ============================================================================

/// Einziger Schreiber des aktuellen Anrufs
pub(crate) struct CallStore {
    tx: watch::Sender<Option<CallAttempt>>,
}

impl CallStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn reader(&self) -> CallReader {
        CallReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> Option<CallAttempt> {
        self.tx.borrow().clone()
    }

    /// Legt einen neuen Anruf an, nur aus `Idle` (kein Anruf oder Reset)
    pub fn begin(&self, mut attempt: CallAttempt, trigger: CallTrigger) -> Option<Transition> {
        let mut result = None;
        self.tx.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|c| c.status != CallStatus::Idle) {
                return false;
            }
            let Some(to) = CallStatus::Idle.next(attempt.direction, trigger) else {
                return false;
            };
            attempt.status = to;
            result = Some(Transition {
                from: CallStatus::Idle,
                to,
                attempt: attempt.clone(),
            });
            *slot = Some(attempt);
            true
        });
        result
    }

    /// Wendet `trigger` auf den Anruf `call_id` an. Veraltete IDs und
    /// ungültige Übergänge werden ignoriert.
    pub fn transition(
        &self,
        call_id: &CallId,
        trigger: CallTrigger,
        reason: Option<&str>,
    ) -> Option<Transition> {
        let mut result = None;
        self.tx.send_if_modified(|slot| {
            let Some(call) = slot.as_mut().filter(|c| &c.id == call_id) else {
                return false;
            };
            let from = call.status;
            let Some(to) = from.next(call.direction, trigger) else {
                return false;
            };

            call.status = to;
            let now = Utc::now();
            if to == CallStatus::InProgress && call.answered_at.is_none() {
                call.answered_at = Some(now);
            }
            if to.is_terminal() {
                call.ended_at = Some(now);
                call.end_reason = reason.map(str::to_string);
            }
            result = Some(Transition {
                from,
                to,
                attempt: call.clone(),
            });
            true
        });
        result
    }

    /// Ändert Flags des aktuellen Anrufs, ohne den Status anzufassen
    pub fn update(&self, call_id: &CallId, f: impl FnOnce(&mut CallAttempt)) -> bool {
        self.tx.send_if_modified(|slot| match slot.as_mut() {
            Some(call) if &call.id == call_id => {
                let status = call.status;
                f(call);
                call.status = status;
                true
            }
            _ => false,
        })
    }

    /// Entfernt einen zurückgesetzten Anruf
    pub fn clear(&self, call_id: &CallId) {
        self.tx.send_if_modified(|slot| {
            if slot
                .as_ref()
                .is_some_and(|c| &c.id == call_id && c.status == CallStatus::Idle)
            {
                *slot = None;
                return true;
            }
            false
        });
    }
}

/// Lesender Zugriff auf den aktuellen Anruf
#[derive(Clone)]
pub struct CallReader {
    rx: watch::Receiver<Option<CallAttempt>>,
}

impl CallReader {
    pub fn current(&self) -> Option<CallAttempt> {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> CallStatus {
        self.rx
            .borrow()
            .as_ref()
            .map(|c| c.status)
            .unwrap_or(CallStatus::Idle)
    }

    /// Wartet auf die nächste Änderung
    pub async fn changed(&mut self) -> Option<CallAttempt> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }

    /// Wartet bis kein Anruf mehr aktiv ist und der Reset durch ist
    pub async fn wait_for_idle(&mut self) {
        let _ = self
            .rx
            .wait_for(|c| c.as_ref().map_or(true, |c| c.status == CallStatus::Idle))
            .await;
    }

    /// Wartet auf einen bestimmten Status
    pub async fn wait_for_status(&mut self, status: CallStatus) {
        let _ = self
            .rx
            .wait_for(|c| c.as_ref().map(|c| c.status).unwrap_or(CallStatus::Idle) == status)
            .await;
    }
}

impl std::fmt::Debug for CallReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallReader")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallDirection::{Incoming, Outgoing};

    #[test]
    fn test_outgoing_happy_path() {
        let s = CallStatus::Idle.next(Outgoing, CallTrigger::Start).unwrap();
        assert_eq!(s, CallStatus::Connecting);
        let s = s.next(Outgoing, CallTrigger::RemoteRinging).unwrap();
        assert_eq!(s, CallStatus::Ringing);
        let s = s.next(Outgoing, CallTrigger::Accept).unwrap();
        assert_eq!(s, CallStatus::InProgress);
        let s = s.next(Outgoing, CallTrigger::LocalEnd).unwrap();
        assert_eq!(s, CallStatus::Completed);
        assert_eq!(s.next(Outgoing, CallTrigger::Reset), Some(CallStatus::Idle));
    }

    #[test]
    fn test_timeouts_depend_on_direction() {
        assert_eq!(
            CallStatus::Ringing.next(Incoming, CallTrigger::Timeout),
            Some(CallStatus::NoAnswer)
        );
        assert_eq!(
            CallStatus::Ringing.next(Outgoing, CallTrigger::Timeout),
            Some(CallStatus::Canceled)
        );
        assert_eq!(
            CallStatus::Connecting.next(Outgoing, CallTrigger::RemoteTimeout),
            Some(CallStatus::NoAnswer)
        );
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(CallStatus::Idle.next(Incoming, CallTrigger::Accept), None);
        assert_eq!(CallStatus::InProgress.next(Incoming, CallTrigger::Start), None);
        assert_eq!(CallStatus::InProgress.next(Outgoing, CallTrigger::Timeout), None);
        assert_eq!(CallStatus::Completed.next(Outgoing, CallTrigger::LocalEnd), None);
        assert_eq!(CallStatus::Connecting.next(Incoming, CallTrigger::Start), None);
        // Terminal bleibt terminal bis zum Reset
        assert_eq!(CallStatus::Failed.next(Outgoing, CallTrigger::TransportError), None);
    }

    #[test]
    fn test_terminal_states() {
        for status in [
            CallStatus::Completed,
            CallStatus::Failed,
            CallStatus::Busy,
            CallStatus::NoAnswer,
            CallStatus::Canceled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
        assert!(CallStatus::InProgress.is_active());
        assert!(!CallStatus::Idle.is_terminal());
    }

    #[test]
    fn test_store_rejects_second_call() {
        let store = CallStore::new();
        let first = CallAttempt::new(CallId::new("a"), Outgoing, "bob", false);
        let second = CallAttempt::new(CallId::new("b"), Incoming, "carol", false);

        assert!(store.begin(first, CallTrigger::Start).is_some());
        assert!(store.begin(second, CallTrigger::IncomingInvite).is_none());
        assert_eq!(store.snapshot().unwrap().id, CallId::new("a"));
    }

    #[test]
    fn test_store_ignores_stale_call_id() {
        let store = CallStore::new();
        store.begin(
            CallAttempt::new(CallId::new("a"), Outgoing, "bob", false),
            CallTrigger::Start,
        );

        assert!(store
            .transition(&CallId::new("old"), CallTrigger::RemoteHangup, None)
            .is_none());
        assert_eq!(store.reader().status(), CallStatus::Connecting);
    }

    #[test]
    fn test_store_records_timestamps() {
        let store = CallStore::new();
        let id = CallId::new("a");
        store.begin(
            CallAttempt::new(id.clone(), Incoming, "bob", true),
            CallTrigger::IncomingInvite,
        );

        let t = store.transition(&id, CallTrigger::Accept, None).unwrap();
        assert!(t.attempt.answered_at.is_some());

        let t = store
            .transition(&id, CallTrigger::RemoteHangup, Some("bye"))
            .unwrap();
        assert_eq!(t.from, CallStatus::InProgress);
        assert_eq!(t.to, CallStatus::Completed);
        assert!(t.attempt.ended_at.is_some());
        assert_eq!(t.attempt.end_reason.as_deref(), Some("bye"));

        store.transition(&id, CallTrigger::Reset, None).unwrap();
        store.clear(&id);
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn test_update_keeps_status() {
        let store = CallStore::new();
        let id = CallId::new("a");
        store.begin(
            CallAttempt::new(id.clone(), Outgoing, "bob", false),
            CallTrigger::Start,
        );

        store.update(&id, |c| {
            c.is_muted = true;
            c.status = CallStatus::Completed;
        });
        let call = store.snapshot().unwrap();
        assert!(call.is_muted);
        assert_eq!(call.status, CallStatus::Connecting);
    }
}
