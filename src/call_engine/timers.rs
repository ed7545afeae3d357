//! Timer für Klingel-Timeouts und den Reset nach Anrufende
//!
//! Jeder Timer gehört zu genau einem Anruf. Beim Feuern entfernt sich ein
//! Timer selbst aus der Tabelle, danach erst läuft seine Aktion.

use crate::signaling::CallId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Eingehender Anruf klingelt (~31s)
    IncomingRing,
    /// Ausgehender Anruf wartet auf Annahme (~35s)
    OutgoingRing,
    /// Verzögerung zwischen Endzustand und `idle`
    ResetGrace,
}

struct ArmedTimer {
    id: u64,
    call_id: CallId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct CallTimers {
    slots: Arc<Mutex<HashMap<TimerKind, ArmedTimer>>>,
    next_id: AtomicU64,
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet `kind` für `call_id`. Ein bereits laufender Timer gleicher
    /// Art wird ersetzt.
    pub fn arm<F>(&self, kind: TimerKind, call_id: &CallId, after: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);

        // Lock halten bis der Slot belegt ist, sonst könnte der Task
        // seinen eigenen Eintrag verpassen
        let mut guard = self.slots.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            {
                let mut slots = slots.lock();
                match slots.get(&kind) {
                    Some(armed) if armed.id == id => {
                        slots.remove(&kind);
                    }
                    // Ersetzt oder abgebrochen
                    _ => return,
                }
            }
            action.await;
        });

        tracing::debug!("Armed {:?} timer for {} ({:?})", kind, call_id, after);
        if let Some(previous) = guard.insert(
            kind,
            ArmedTimer {
                id,
                call_id: call_id.clone(),
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// Bricht `kind` ab, falls er noch läuft
    pub fn cancel(&self, kind: TimerKind) -> bool {
        match self.slots.lock().remove(&kind) {
            Some(armed) => {
                armed.handle.abort();
                tracing::debug!("Canceled {:?} timer for {}", kind, armed.call_id);
                true
            }
            None => false,
        }
    }

    /// Bricht alle Timer eines Anrufs ab
    pub fn cancel_call(&self, call_id: &CallId) {
        self.slots.lock().retain(|_, armed| {
            if &armed.call_id == call_id {
                armed.handle.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn cancel_all(&self) {
        for (_, armed) in self.slots.lock().drain() {
            armed.handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.lock().contains_key(&kind)
    }

    /// Alle aktuell laufenden Timer
    pub fn armed(&self) -> Vec<(TimerKind, CallId)> {
        self.slots
            .lock()
            .iter()
            .map(|(kind, armed)| (*kind, armed.call_id.clone()))
            .collect()
    }
}

impl Drop for CallTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::settle;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let make = move || {
            let c = Arc::clone(&c);
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_clears_slot() {
        let timers = CallTimers::new();
        let (count, action) = counter();
        let call = CallId::new("a");

        timers.arm(TimerKind::IncomingRing, &call, Duration::from_secs(31), action());
        assert!(timers.is_armed(TimerKind::IncomingRing));

        tokio::time::sleep(Duration::from_millis(30_999)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(TimerKind::IncomingRing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canceled_timer_never_fires() {
        let timers = CallTimers::new();
        let (count, action) = counter();

        timers.arm(TimerKind::OutgoingRing, &CallId::new("a"), Duration::from_secs(35), action());
        assert!(timers.cancel(TimerKind::OutgoingRing));
        assert!(!timers.cancel(TimerKind::OutgoingRing));

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timers.armed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous() {
        let timers = CallTimers::new();
        let (count, action) = counter();

        timers.arm(TimerKind::ResetGrace, &CallId::new("a"), Duration::from_secs(1), action());
        timers.arm(TimerKind::ResetGrace, &CallId::new("b"), Duration::from_secs(2), action());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_call_only_hits_that_call() {
        let timers = CallTimers::new();
        let (_count, action) = counter();

        timers.arm(TimerKind::IncomingRing, &CallId::new("a"), Duration::from_secs(5), action());
        timers.arm(TimerKind::ResetGrace, &CallId::new("b"), Duration::from_secs(5), action());
        timers.cancel_call(&CallId::new("a"));

        assert_eq!(
            timers.armed(),
            vec![(TimerKind::ResetGrace, CallId::new("b"))]
        );
    }
}
