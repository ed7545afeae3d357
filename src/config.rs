//! Konfiguration
//!
//! Alle Timeouts und Intervalle der Call-Orchestrierung an einer Stelle.
//! Die Defaults entsprechen dem Verhalten der App; über Umgebungsvariablen
//! können einzelne Werte überschrieben werden.

use serde::Deserialize;
use std::time::Duration;

/// Default Signaling URL (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev";

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,

    /// Klingeldauer für eingehende Anrufe
    pub incoming_ring_timeout: Duration,
    /// Wartezeit für ausgehende Anrufe, länger als `incoming_ring_timeout`
    /// damit im Normalfall der Timeout des Angerufenen zuerst greift
    pub outgoing_ring_timeout: Duration,
    /// Verzögerung bis ein beendeter Anruf auf Idle zurückgesetzt wird
    pub reset_grace: Duration,

    /// Pause bevor ein fehlgeschlagenes Signal erneut angewendet wird
    pub signal_retry_delay: Duration,

    pub credential_retries: u32,
    pub credential_backoff: Duration,
    pub credential_ttl: Duration,

    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,

    pub stats_interval: Duration,
    pub stall_threshold: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            incoming_ring_timeout: Duration::from_millis(31_000),
            outgoing_ring_timeout: Duration::from_millis(35_000),
            reset_grace: Duration::from_millis(500),
            signal_retry_delay: Duration::from_secs(1),
            credential_retries: 3,
            credential_backoff: Duration::from_secs(1),
            credential_ttl: Duration::from_secs(600),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            reconnect_base: Duration::from_millis(2_000),
            reconnect_max: Duration::from_millis(120_000),
            stats_interval: Duration::from_secs(2),
            stall_threshold: Duration::from_secs(15),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Umgebungsvariablen
    ///
    /// `SIGNALING_URL` setzt den Server, `CALL_<NAME>_MS` überschreibt
    /// einzelne Zeitwerte (z.B. `CALL_INCOMING_RING_TIMEOUT_MS=20000`).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SIGNALING_URL") {
            config.signaling_url = url;
        }

        let overrides: [(&str, &mut Duration); 6] = [
            ("CALL_INCOMING_RING_TIMEOUT_MS", &mut config.incoming_ring_timeout),
            ("CALL_OUTGOING_RING_TIMEOUT_MS", &mut config.outgoing_ring_timeout),
            ("CALL_RESET_GRACE_MS", &mut config.reset_grace),
            ("CALL_PROBE_INTERVAL_MS", &mut config.probe_interval),
            ("CALL_RECONNECT_MAX_MS", &mut config.reconnect_max),
            ("CALL_STALL_THRESHOLD_MS", &mut config.stall_threshold),
        ];

        for (name, slot) in overrides {
            if let Some(value) = read_millis(name) {
                *slot = value;
            }
        }

        config
    }
}

fn read_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}
