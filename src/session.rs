//! Session token access and session-invalid notifications.

use crate::plugin::PluginMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Source of the current session id.
pub trait TokenSource: Send + Sync {
    fn session_id(&self) -> String;
}

/// A token fixed at startup (from the CLI or config file).
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenSource for StaticToken {
    fn session_id(&self) -> String {
        self.0.clone()
    }
}

/// Reads the token from an environment variable on every request, so a
/// refreshed session is picked up without restarting.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenSource for EnvToken {
    fn session_id(&self) -> String {
        std::env::var(&self.var).unwrap_or_default()
    }
}

/// Broadcasts shell messages such as the session-invalid sign out.
///
/// Fire-and-forget: sending with no subscribers is not an error. Clones
/// share the rejected flag, which stays set even when a slow subscriber
/// lags behind and loses messages.
#[derive(Debug, Clone)]
pub struct SessionNotifier {
    tx: broadcast::Sender<PluginMessage>,
    invalid: Arc<AtomicBool>,
}

impl Default for SessionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            invalid: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginMessage> {
        self.tx.subscribe()
    }

    /// Signal that the session was rejected by the server.
    pub fn session_invalid(&self) {
        warn!("Session rejected by the server, signing out");
        self.invalid.store(true, Ordering::SeqCst);
        let _ = self.tx.send(PluginMessage::SignOut);
    }

    /// Whether the server has rejected the session at least once.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken::new("abc").session_id(), "abc");
    }

    #[test]
    fn test_env_token_missing_is_empty() {
        let token = EnvToken::new("DGFETCH_TEST_TOKEN_THAT_IS_NOT_SET");
        assert_eq!(token.session_id(), "");
    }

    #[tokio::test]
    async fn test_session_invalid_broadcasts_signout() {
        let notifier = SessionNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.session_invalid();
        assert_eq!(rx.recv().await.unwrap(), PluginMessage::SignOut);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_session_invalid_without_subscribers() {
        let notifier = SessionNotifier::new();
        assert!(!notifier.is_invalid());
        notifier.session_invalid();
        assert!(notifier.is_invalid());
    }

    #[test]
    fn test_rejection_survives_lagging_subscriber() {
        let notifier = SessionNotifier::new();
        let observer = notifier.clone();
        let mut rx = notifier.subscribe();
        for _ in 0..65 {
            notifier.session_invalid();
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(1))
        ));
        assert!(observer.is_invalid());
    }
}
