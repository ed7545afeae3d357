//! ICE Server Credentials
//!
//! Holt kurzlebige STUN/TURN Credentials vom Backend. Schlägt das fehl,
//! wird mit einer statischen Fallback-Liste weitergearbeitet: ein Anruf
//! soll nie an fehlenden Credentials scheitern.

use crate::config::CallConfig;
use crate::notify::{NoticeKind, Notifier};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// TYPES
// ============================================================================

/// Ein STUN oder TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Statische Server für den Degraded Mode. Die TURN Credentials sind fix
/// und können abgelaufen sein.
static FALLBACK_ICE_SERVERS: Lazy<Vec<IceServer>> = Lazy::new(|| {
    vec![
        IceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
        IceServer {
            urls: vec![
                "turn:openrelay.metered.ca:80".to_string(),
                "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
            ],
            username: Some("openrelayproject".to_string()),
            credential: Some("openrelayproject".to_string()),
        },
    ]
});

pub fn fallback_ice_servers() -> Vec<IceServer> {
    FALLBACK_ICE_SERVERS.clone()
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Backend-Endpunkt für TURN Credentials
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn fetch_ice_servers(&self) -> anyhow::Result<Vec<IceServer>>;
}

/// Authentifizierte Sitzung des lokalen Benutzers
#[async_trait]
pub trait AuthSession: Send + Sync {
    fn has_session(&self) -> bool;

    /// Aktuelles Access Token (für den Signaling-Server)
    fn access_token(&self) -> Option<String>;

    async fn refresh(&self) -> anyhow::Result<()>;
}

// ============================================================================
// CREDENTIAL PROVIDER
// ============================================================================

struct CachedServers {
    servers: Vec<IceServer>,
    fetched_at: Instant,
}

pub struct CredentialProvider {
    service: Arc<dyn CredentialService>,
    auth: Arc<dyn AuthSession>,
    notifier: Notifier,
    retries: u32,
    backoff: Duration,
    ttl: Duration,
    cache: Mutex<Option<CachedServers>>,
}

impl CredentialProvider {
    pub fn new(
        service: Arc<dyn CredentialService>,
        auth: Arc<dyn AuthSession>,
        notifier: Notifier,
        config: &CallConfig,
    ) -> Self {
        Self {
            service,
            auth,
            notifier,
            retries: config.credential_retries,
            backoff: config.credential_backoff,
            ttl: config.credential_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Liefert die ICE Server für einen neuen Anruf
    ///
    /// Gibt nie einen Fehler zurück: jeder Fehlerpfad endet in der
    /// Fallback-Liste plus einem Hinweis an den Benutzer.
    pub async fn get_ice_servers(&self, force_refresh: bool) -> Vec<IceServer> {
        if !force_refresh {
            if let Some(servers) = self.cached() {
                tracing::debug!("Using {} cached ICE servers", servers.len());
                return servers;
            }
        }

        if !self.auth.has_session() {
            tracing::info!("No active session, using fallback ICE servers");
            return fallback_ice_servers();
        }

        let mut delay = self.backoff;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            match self.service.fetch_ice_servers().await {
                Ok(servers) if !servers.is_empty() => {
                    tracing::info!("Fetched {} ICE servers", servers.len());
                    *self.cache.lock() = Some(CachedServers {
                        servers: servers.clone(),
                        fetched_at: Instant::now(),
                    });
                    return servers;
                }
                Ok(_) => {
                    tracing::warn!(
                        "ICE server fetch attempt {} returned no servers",
                        attempt + 1
                    );
                }
                Err(e) => {
                    tracing::warn!("ICE server fetch attempt {} failed: {:#}", attempt + 1, e);
                }
            }
        }

        let servers = fallback_ice_servers();
        tracing::warn!(
            "Giving up on ICE server fetch, using {} fallback servers",
            servers.len()
        );
        self.notifier.warn(
            NoticeKind::ConnectionDegraded,
            "Could not load relay servers, call quality may be degraded",
        );
        servers
    }

    fn cached(&self) -> Option<Vec<IceServer>> {
        let cache = self.cache.lock();
        cache
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.ttl)
            .map(|c| c.servers.clone())
    }
}
