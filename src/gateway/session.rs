//! Device session management.
//!
//! At most one device session is active. A new accept while another session
//! exists closes and replaces the old one; the conversation context resets
//! with the fresh session id, which is the intended behavior across
//! reconnects.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::metrics;

/// Outbound frames queued per session before the socket task drains them.
const OUTBOUND_CHANNEL_SIZE: usize = 32;

/// The active device session.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub device_id: String,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

struct ActiveConnection {
    session: DeviceSession,
    outbound: mpsc::Sender<String>,
    closer: CancellationToken,
}

/// Manages the single active device connection.
#[derive(Default)]
pub struct ConnectionManager {
    active: Mutex<Option<ActiveConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a device is currently connected.
    pub fn is_connected(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    /// Session id of the active connection, if any.
    pub fn session_id(&self) -> Option<String> {
        self.active
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|c| c.session.session_id.clone()))
    }

    /// Register a new connection, replacing (and closing) any existing one.
    ///
    /// Returns the minted session, the receiver the socket task drains for
    /// outbound frames, and the token that fires when this session is
    /// replaced.
    pub fn connect(
        &self,
        device_id: &str,
    ) -> (DeviceSession, mpsc::Receiver<String>, CancellationToken) {
        let session_id = format!("{device_id}-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let now = Utc::now();
        let session = DeviceSession {
            device_id: device_id.to_owned(),
            session_id,
            connected_at: now,
            last_activity: now,
            message_count: 0,
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let closer = CancellationToken::new();

        let replaced = {
            let mut active = match self.active.lock() {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
            let previous = active.replace(ActiveConnection {
                session: session.clone(),
                outbound: outbound_tx,
                closer: closer.clone(),
            });
            previous.map(|old| old.closer)
        };

        if let Some(old_closer) = replaced {
            warn!("replaced_existing_connection");
            old_closer.cancel();
        }

        metrics().active_sessions.set(1);
        info!(
            device_id,
            session_id = %session.session_id,
            "connection_established"
        );

        (session, outbound_rx, closer)
    }

    /// Remove the connection if it is still the active one. A session that
    /// was already replaced leaves the newer connection untouched.
    pub fn disconnect(&self, session_id: &str) {
        let removed = {
            let mut active = match self.active.lock() {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
            match active.as_ref() {
                Some(current) if current.session.session_id == session_id => {
                    *active = None;
                    true
                }
                _ => false,
            }
        };

        if removed {
            metrics().active_sessions.set(0);
            info!(session_id, "connection_removed");
        }
    }

    /// Queue a JSON text frame for the device.
    ///
    /// Returns `false` when no device is connected or the session's socket
    /// task is gone; callers log and drop.
    pub async fn send_response(&self, frame: String) -> bool {
        let outbound = {
            let mut active = match self.active.lock() {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
            match active.as_mut() {
                Some(connection) => {
                    connection.session.last_activity = Utc::now();
                    connection.session.message_count += 1;
                    connection.outbound.clone()
                }
                None => {
                    warn!("no_device_connected");
                    return false;
                }
            }
        };

        match outbound.send(frame).await {
            Ok(()) => {
                debug!("message_sent");
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_mints_a_fresh_session_id_per_connection() {
        let manager = ConnectionManager::new();
        let (first, _rx1, _closer1) = manager.connect("companion-001");
        let (second, _rx2, _closer2) = manager.connect("companion-001");
        assert_ne!(first.session_id, second.session_id);
        assert!(first.session_id.starts_with("companion-001-"));
    }

    #[test]
    fn replacement_cancels_the_previous_socket() {
        let manager = ConnectionManager::new();
        let (_first, _rx1, closer1) = manager.connect("companion-001");
        assert!(!closer1.is_cancelled());

        let (_second, _rx2, closer2) = manager.connect("companion-001");
        assert!(closer1.is_cancelled());
        assert!(!closer2.is_cancelled());
        assert!(manager.is_connected());
    }

    #[test]
    fn stale_disconnect_leaves_replacement_active() {
        let manager = ConnectionManager::new();
        let (first, _rx1, _closer1) = manager.connect("companion-001");
        let (second, _rx2, _closer2) = manager.connect("companion-001");

        // The replaced socket task disconnects late; the new session stays.
        manager.disconnect(&first.session_id);
        assert!(manager.is_connected());
        assert_eq!(manager.session_id(), Some(second.session_id.clone()));

        manager.disconnect(&second.session_id);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn send_without_device_reports_failure() {
        let manager = ConnectionManager::new();
        assert!(!manager.send_response("{}".to_owned()).await);
    }

    #[tokio::test]
    async fn send_reaches_the_active_socket_queue() {
        let manager = ConnectionManager::new();
        let (_session, mut rx, _closer) = manager.connect("companion-001");

        assert!(manager.send_response("{\"type\":\"response\"}".to_owned()).await);
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("response"));
    }
}
