//! Client session authentication
//!
//! Companion-app clients must pass a challenge/response exchange before
//! privileged commands are executed, on top of the envelope encryption that
//! every message already carries:
//!
//! ```text
//! client                                   authenticator
//!   │  AUTH_REQUEST {client_id}                  │
//!   │ ─────────────────────────────────────────► │  pending session, random challenge
//!   │  CHALLENGE_REQUIRED {challenge}            │
//!   │ ◄───────────────────────────────────────── │
//!   │  AUTH_RESPONSE {client_id, challenge,      │
//!   │    response = HMAC(key, challenge:id)}     │
//!   │ ─────────────────────────────────────────► │  verify in constant time
//!   │  AUTHENTICATED {session_key}               │
//!   │ ◄───────────────────────────────────────── │
//!   │  GET_STATUS:session_key=...                │
//!   │ ─────────────────────────────────────────► │  authenticated && unexpired && key match
//! ```
//!
//! Sessions are keyed by client IP; a new `AUTH_REQUEST` from the same IP
//! replaces whatever session existed before.

use crate::error::Result;
use binlink_crypto::challenge::{generate_challenge, generate_session_key, verify_challenge_response};
use binlink_crypto::constant_time::ct_eq;
use binlink_crypto::EnvelopeKey;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One client's session, pending or authenticated.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Identity the client claimed
    pub client_id: String,
    /// Source IP the session is bound to
    pub client_ip: IpAddr,
    /// Challenge issued on `AUTH_REQUEST`
    pub challenge: String,
    /// Issued on successful `AUTH_RESPONSE`
    pub session_key: Option<String>,
    /// Creation or promotion time
    pub issued_at: Instant,
    /// Hard expiry
    pub expires_at: Instant,
    /// Challenge answered correctly
    pub authenticated: bool,
}

impl ClientSession {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Session details safe to report (no challenge, no key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    /// Identity the client claimed
    pub client_id: String,
    /// Source IP
    pub client_ip: IpAddr,
    /// Challenge answered correctly
    pub authenticated: bool,
    /// Seconds until the session expires
    pub expires_in_secs: u64,
}

/// Issues and checks client sessions.
pub struct SessionAuthenticator {
    key: EnvelopeKey,
    token_timeout: Duration,
    sessions: Mutex<HashMap<IpAddr, ClientSession>>,
}

impl SessionAuthenticator {
    /// Create an authenticator using the link's pre-shared key.
    #[must_use]
    pub fn new(key: EnvelopeKey, token_timeout: Duration) -> Self {
        Self {
            key,
            token_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session lifetime.
    #[must_use]
    pub fn token_timeout(&self) -> Duration {
        self.token_timeout
    }

    /// Start authentication for `client_id` at `client_ip`.
    ///
    /// Returns the challenge to send back.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Crypto`](crate::CoreError::Crypto) if no
    /// challenge can be drawn.
    pub async fn request(&self, client_ip: IpAddr, client_id: &str) -> Result<String> {
        let challenge = generate_challenge()?;
        let now = Instant::now();

        let previous = self.sessions.lock().await.insert(
            client_ip,
            ClientSession {
                client_id: client_id.to_string(),
                client_ip,
                challenge: challenge.clone(),
                session_key: None,
                issued_at: now,
                expires_at: now + self.token_timeout,
                authenticated: false,
            },
        );

        if previous.is_some() {
            tracing::debug!("AUTH_REQUEST from {} replaced an existing session", client_ip);
        }
        tracing::info!("Challenge issued to {} ({})", client_id, client_ip);
        Ok(challenge)
    }

    /// Complete authentication.
    ///
    /// Returns the new session key, or `None` if anything does not match.
    /// A pending session is discarded on failure.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Crypto`](crate::CoreError::Crypto) if no
    /// session key can be drawn.
    pub async fn respond(
        &self,
        client_ip: IpAddr,
        client_id: &str,
        challenge: &str,
        response: &str,
    ) -> Result<Option<String>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        let Some(session) = sessions.get_mut(&client_ip) else {
            tracing::warn!("AUTH_RESPONSE from {} without a pending challenge", client_ip);
            return Ok(None);
        };

        let valid = !session.authenticated
            && !session.is_expired(now)
            && session.client_id == client_id
            && ct_eq(session.challenge.as_bytes(), challenge.as_bytes())
            && verify_challenge_response(&self.key, &session.challenge, client_id, response);

        if !valid {
            if !session.authenticated {
                sessions.remove(&client_ip);
            }
            tracing::warn!("Authentication failed for {} ({})", client_id, client_ip);
            return Ok(None);
        }

        let session_key = generate_session_key()?;
        session.session_key = Some(session_key.clone());
        session.authenticated = true;
        session.issued_at = now;
        session.expires_at = now + self.token_timeout;

        tracing::info!("Client authenticated: {} ({})", client_id, client_ip);
        Ok(Some(session_key))
    }

    /// Check a privileged command's session key.
    pub async fn validate(&self, client_ip: IpAddr, session_key: Option<&str>) -> bool {
        let Some(candidate) = session_key else {
            return false;
        };
        let now = Instant::now();
        let sessions = self.sessions.lock().await;

        match sessions.get(&client_ip) {
            Some(ClientSession {
                authenticated: true,
                session_key: Some(key),
                expires_at,
                ..
            }) => now < *expires_at && ct_eq(key.as_bytes(), candidate.as_bytes()),
            _ => false,
        }
    }

    /// End the session for `client_ip`.
    ///
    /// Returns `true` if there was an authenticated session.
    pub async fn logout(&self, client_ip: IpAddr) -> bool {
        match self.sessions.lock().await.remove(&client_ip) {
            Some(session) => {
                tracing::info!("Client logged out: {} ({})", session.client_id, client_ip);
                session.authenticated
            }
            None => false,
        }
    }

    /// Remove expired sessions.
    ///
    /// Returns the number of sessions removed.
    pub async fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!("Removed {} expired client sessions", removed);
        }
        removed
    }

    /// Number of live authenticated sessions.
    pub async fn active_sessions(&self) -> usize {
        let now = Instant::now();
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.authenticated && !s.is_expired(now))
            .count()
    }

    /// Report on the session bound to `client_ip`.
    pub async fn client_info(&self, client_ip: IpAddr) -> Option<ClientInfo> {
        let now = Instant::now();
        let sessions = self.sessions.lock().await;
        sessions
            .get(&client_ip)
            .filter(|s| !s.is_expired(now))
            .map(|s| ClientInfo {
                client_id: s.client_id.clone(),
                client_ip: s.client_ip,
                authenticated: s.authenticated,
                expires_in_secs: s.expires_at.saturating_duration_since(now).as_secs(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlink_crypto::challenge::challenge_response;

    const CLIENT: &str = "10.0.0.9";

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(EnvelopeKey::from_passphrase("K"), Duration::from_secs(300))
    }

    fn client_ip() -> IpAddr {
        CLIENT.parse().unwrap()
    }

    async fn login(auth: &SessionAuthenticator) -> String {
        let challenge = auth.request(client_ip(), "app").await.unwrap();
        let response =
            challenge_response(&EnvelopeKey::from_passphrase("K"), &challenge, "app").unwrap();
        auth.respond(client_ip(), "app", &challenge, &response)
            .await
            .unwrap()
            .expect("authenticated")
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let auth = authenticator();
        let key = login(&auth).await;

        assert!(auth.validate(client_ip(), Some(&key)).await);
        assert!(!auth.validate(client_ip(), Some("wrong")).await);
        assert!(!auth.validate(client_ip(), None).await);
        assert_eq!(auth.active_sessions().await, 1);

        let info = auth.client_info(client_ip()).await.unwrap();
        assert!(info.authenticated);
        assert_eq!(info.client_id, "app");
    }

    #[tokio::test]
    async fn test_session_bound_to_ip() {
        let auth = authenticator();
        let key = login(&auth).await;
        assert!(!auth.validate("10.0.0.10".parse().unwrap(), Some(&key)).await);
    }

    #[tokio::test]
    async fn test_wrong_response_discards_pending() {
        let auth = authenticator();
        let challenge = auth.request(client_ip(), "app").await.unwrap();

        let outcome = auth
            .respond(client_ip(), "app", &challenge, "00")
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(auth.client_info(client_ip()).await.is_none());

        // The challenge is gone, so even the right answer fails now.
        let response =
            challenge_response(&EnvelopeKey::from_passphrase("K"), &challenge, "app").unwrap();
        assert!(auth
            .respond(client_ip(), "app", &challenge, &response)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_client_id_must_match() {
        let auth = authenticator();
        let challenge = auth.request(client_ip(), "app").await.unwrap();
        let response =
            challenge_response(&EnvelopeKey::from_passphrase("K"), &challenge, "other").unwrap();
        assert!(auth
            .respond(client_ip(), "other", &challenge, &response)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_new_request_supersedes_session() {
        let auth = authenticator();
        let key = login(&auth).await;

        auth.request(client_ip(), "app").await.unwrap();
        assert!(!auth.validate(client_ip(), Some(&key)).await);
        assert_eq!(auth.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_logout() {
        let auth = authenticator();
        let key = login(&auth).await;

        assert!(auth.logout(client_ip()).await);
        assert!(!auth.validate(client_ip(), Some(&key)).await);
        assert!(!auth.logout(client_ip()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires() {
        let auth = authenticator();
        let key = login(&auth).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(auth.validate(client_ip(), Some(&key)).await);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!auth.validate(client_ip(), Some(&key)).await);

        assert_eq!(auth.cleanup().await, 1);
        assert!(auth.client_info(client_ip()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_challenge_rejected() {
        let auth = authenticator();
        let challenge = auth.request(client_ip(), "app").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;

        let response =
            challenge_response(&EnvelopeKey::from_passphrase("K"), &challenge, "app").unwrap();
        assert!(auth
            .respond(client_ip(), "app", &challenge, &response)
            .await
            .unwrap()
            .is_none());
    }
}
