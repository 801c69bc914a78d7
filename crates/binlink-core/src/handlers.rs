//! Built-in command handlers
//!
//! Each function builds a [`Handler`] closed over the state it needs; the
//! `register_*` helpers install a whole group on a [`MessageRouter`].
//! Feature commands (`GET_*`, `SET_*`, ...) are registered the same way by
//! whoever provides them.

use crate::registry::{DeviceInfo, DeviceRegistry};
use crate::router::{Handler, MessageRouter, Request, handler_fn};
use crate::session::SessionAuthenticator;
use binlink_crypto::unix_now;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

/// Start client authentication
pub const AUTH_REQUEST: &str = "AUTH_REQUEST";
/// Answer a challenge
pub const AUTH_RESPONSE: &str = "AUTH_RESPONSE";
/// End a client session
pub const LOGOUT: &str = "LOGOUT";
/// Device looking for a hub
pub const DEVICE_DISCOVERY: &str = "DEVICE_DISCOVERY";
/// Device (re)connecting to a hub
pub const DEVICE_CONNECT: &str = "DEVICE_CONNECT";
/// Device registering after `SERVER_ONLINE`
pub const DEVICE_REGISTER: &str = "DEVICE_REGISTER";
/// Device liveness
pub const HEARTBEAT: &str = "HEARTBEAT";
/// Hub asking devices for a heartbeat
pub const HEARTBEAT_REQUEST: &str = "HEARTBEAT_REQUEST";
/// Hub acknowledging a device
pub const SERVER_ONLINE: &str = "SERVER_ONLINE";

/// Client id assumed when an auth message does not name one; the
/// companion app sends none.
pub const DEFAULT_CLIENT_ID: &str = "flutter_app";

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

#[derive(Debug, Deserialize)]
struct AuthRequestArgs {
    #[serde(default = "default_client_id")]
    client_id: String,
}

impl Default for AuthRequestArgs {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponseArgs {
    #[serde(default = "default_client_id")]
    client_id: String,
    challenge: String,
    response: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatArgs {
    device_id: String,
}

/// Reply sent instead of running a privileged command.
#[must_use]
pub fn auth_required_reply() -> String {
    json!({
        "status": "AUTH_REQUIRED",
        "message": "authentication required for this command",
    })
    .to_string()
}

/// `HEARTBEAT:<identity>` as sent by a link.
#[must_use]
pub fn heartbeat_message(identity: &DeviceInfo) -> String {
    announce_message(HEARTBEAT, identity)
}

/// `<prefix>:<identity json>`.
#[must_use]
pub fn announce_message(prefix: &str, identity: &DeviceInfo) -> String {
    // DeviceInfo has string keys only; encoding cannot fail.
    let body = serde_json::to_string(identity).unwrap_or_else(|_| "{}".to_string());
    format!("{prefix}:{body}")
}

/// `AUTH_REQUEST:{"client_id": ..}` issues a challenge.
pub fn auth_request(sessions: Arc<SessionAuthenticator>) -> Handler {
    handler_fn(move |request: Request| {
        let sessions = Arc::clone(&sessions);
        async move {
            let parsed = if request.args.is_empty() {
                Ok(AuthRequestArgs::default())
            } else {
                request.json_args()
            };
            let args = match parsed {
                Ok(args) => args,
                Err(e) => {
                    tracing::warn!("Malformed AUTH_REQUEST from {}: {}", request.from, e);
                    return Some(json!({"status": "AUTH_ERROR", "message": "malformed request"}).to_string());
                }
            };
            match sessions.request(request.client_ip(), &args.client_id).await {
                Ok(challenge) => Some(
                    json!({
                        "status": "CHALLENGE_REQUIRED",
                        "challenge": challenge,
                        "timestamp": unix_now(),
                        "message": "answer the challenge to authenticate",
                    })
                    .to_string(),
                ),
                Err(e) => {
                    tracing::warn!("Could not issue challenge: {}", e);
                    Some(json!({"status": "AUTH_ERROR", "message": "internal error"}).to_string())
                }
            }
        }
    })
}

/// `AUTH_RESPONSE:{"client_id", "challenge", "response"}` completes it.
pub fn auth_response(sessions: Arc<SessionAuthenticator>) -> Handler {
    handler_fn(move |request: Request| {
        let sessions = Arc::clone(&sessions);
        async move {
            let failed = || Some(json!({"status": "AUTH_FAILED", "message": "authentication failed"}).to_string());

            let Ok(args) = request.json_args::<AuthResponseArgs>() else {
                tracing::warn!("Malformed AUTH_RESPONSE from {}", request.from);
                return failed();
            };
            match sessions
                .respond(request.client_ip(), &args.client_id, &args.challenge, &args.response)
                .await
            {
                Ok(Some(session_key)) => Some(
                    json!({
                        "status": "AUTHENTICATED",
                        "session_key": session_key,
                        "message": "authenticated",
                    })
                    .to_string(),
                ),
                Ok(None) => failed(),
                Err(e) => {
                    tracing::warn!("Could not complete authentication: {}", e);
                    failed()
                }
            }
        }
    })
}

/// `LOGOUT:session_key=..` ends the caller's session.
pub fn logout(sessions: Arc<SessionAuthenticator>) -> Handler {
    handler_fn(move |request: Request| {
        let sessions = Arc::clone(&sessions);
        async move {
            sessions.logout(request.client_ip()).await;
            Some(json!({"status": "LOGGED_OUT"}).to_string())
        }
    })
}

/// Install `AUTH_REQUEST`, `AUTH_RESPONSE` (public) and `LOGOUT` (authenticated).
pub fn register_auth_handlers(router: &MessageRouter, sessions: &Arc<SessionAuthenticator>) {
    router.register(AUTH_REQUEST, false, auth_request(Arc::clone(sessions)));
    router.register(AUTH_RESPONSE, false, auth_response(Arc::clone(sessions)));
    router.register(LOGOUT, true, logout(Arc::clone(sessions)));
}

fn device_address(request: &Request) -> SocketAddr {
    request
        .from
        .socket_addr()
        .unwrap_or_else(|| SocketAddr::new(request.client_ip(), 0))
}

/// `DEVICE_*:<json>` registers the device.
///
/// With `acknowledge` set the device is answered with `SERVER_ONLINE`.
pub fn device_announce(registry: Arc<DeviceRegistry>, acknowledge: bool) -> Handler {
    handler_fn(move |request: Request| {
        let registry = Arc::clone(&registry);
        async move {
            let info: DeviceInfo = match request.json_args() {
                Ok(info) => info,
                Err(e) => {
                    tracing::warn!("Malformed {} from {}: {}", request.command, request.from, e);
                    return None;
                }
            };
            if let Err(e) = registry.register(info, device_address(&request)).await {
                tracing::warn!("Rejected {} from {}: {}", request.command, request.from, e);
                return None;
            }
            acknowledge.then(|| SERVER_ONLINE.to_string())
        }
    })
}

/// `HEARTBEAT:{"device_id": ..}` refreshes the device.
pub fn device_heartbeat(registry: Arc<DeviceRegistry>) -> Handler {
    handler_fn(move |request: Request| {
        let registry = Arc::clone(&registry);
        async move {
            match request.json_args::<HeartbeatArgs>() {
                // Unknown devices are logged by the registry and otherwise ignored.
                Ok(args) => {
                    let _ = registry.heartbeat(&args.device_id).await;
                }
                Err(e) => tracing::warn!("Malformed HEARTBEAT from {}: {}", request.from, e),
            }
            None
        }
    })
}

/// Install the hub's device lifecycle handlers.
pub fn register_hub_handlers(router: &MessageRouter, registry: &Arc<DeviceRegistry>) {
    router.register(DEVICE_DISCOVERY, false, device_announce(Arc::clone(registry), true));
    router.register(DEVICE_CONNECT, false, device_announce(Arc::clone(registry), true));
    router.register(DEVICE_REGISTER, false, device_announce(Arc::clone(registry), false));
    router.register(HEARTBEAT, false, device_heartbeat(Arc::clone(registry)));
}

/// `HEARTBEAT_REQUEST` is answered with `HEARTBEAT:<identity>`.
pub fn heartbeat_request(identity: Arc<DeviceInfo>) -> Handler {
    handler_fn(move |_request: Request| {
        let identity = Arc::clone(&identity);
        async move { Some(heartbeat_message(&identity)) }
    })
}

/// `SERVER_ONLINE` is answered with `DEVICE_REGISTER:<identity>`.
pub fn server_online(identity: Arc<DeviceInfo>) -> Handler {
    handler_fn(move |request: Request| {
        let identity = Arc::clone(&identity);
        async move {
            tracing::info!("Hub online at {}", request.from);
            Some(announce_message(DEVICE_REGISTER, &identity))
        }
    })
}

/// Install the link's answers to hub traffic.
pub fn register_link_handlers(router: &MessageRouter, identity: &Arc<DeviceInfo>) {
    router.register(HEARTBEAT_REQUEST, false, heartbeat_request(Arc::clone(identity)));
    router.register(SERVER_ONLINE, false, server_online(Arc::clone(identity)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteOutcome;
    use binlink_crypto::EnvelopeKey;
    use binlink_crypto::challenge::challenge_response;
    use binlink_transport::PeerAddress;
    use std::time::Duration;

    struct Fixture {
        router: MessageRouter,
        sessions: Arc<SessionAuthenticator>,
        registry: Arc<DeviceRegistry>,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionAuthenticator::new(
            EnvelopeKey::from_passphrase("K"),
            Duration::from_secs(300),
        ));
        let registry = Arc::new(DeviceRegistry::new(Duration::from_secs(300)));
        let router = MessageRouter::new(Arc::clone(&sessions));
        register_auth_handlers(&router, &sessions);
        register_hub_handlers(&router, &registry);
        Fixture {
            router,
            sessions,
            registry,
        }
    }

    fn from(addr: &str) -> PeerAddress {
        PeerAddress::Udp(addr.parse().unwrap())
    }

    fn reply_json(outcome: RouteOutcome) -> serde_json::Value {
        match outcome {
            RouteOutcome::Reply(reply) => serde_json::from_str(&reply).unwrap(),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_device_discovery_registers_and_acknowledges() {
        let f = fixture();
        let outcome = f
            .router
            .dispatch(
                r#"DEVICE_DISCOVERY:{"device_id":"D1","device_name":"Bin-1"}"#,
                from("10.0.0.5:8888"),
            )
            .await;
        assert_eq!(outcome, RouteOutcome::Reply(SERVER_ONLINE.into()));

        let record = f.registry.get("D1").await.unwrap();
        assert_eq!(record.ip_address().to_string(), "10.0.0.5");
        assert_eq!(record.info.display_name(), "Bin-1");
    }

    #[tokio::test]
    async fn test_device_register_is_silent() {
        let f = fixture();
        let outcome = f
            .router
            .dispatch(r#"DEVICE_REGISTER:{"device_id":"D1"}"#, from("10.0.0.5:8888"))
            .await;
        assert_eq!(outcome, RouteOutcome::NoReply);
        assert_eq!(f.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_announce_ignored() {
        let f = fixture();
        let outcome = f
            .router
            .dispatch("DEVICE_CONNECT:not-json", from("10.0.0.5:8888"))
            .await;
        assert_eq!(outcome, RouteOutcome::NoReply);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_known_device() {
        let f = fixture();
        f.router
            .dispatch(r#"DEVICE_CONNECT:{"device_id":"D1"}"#, from("10.0.0.5:8888"))
            .await;
        f.router
            .dispatch(r#"HEARTBEAT:{"device_id":"D1","uptime":12}"#, from("10.0.0.5:8888"))
            .await;
        assert_eq!(f.registry.get("D1").await.unwrap().heartbeat_count, 2);

        let outcome = f
            .router
            .dispatch(r#"HEARTBEAT:{"device_id":"ghost"}"#, from("10.0.0.6:8888"))
            .await;
        assert_eq!(outcome, RouteOutcome::NoReply);
        assert!(f.registry.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_auth_flow_and_logout() {
        let f = fixture();
        let client = from("10.0.0.9:5000");

        let challenge = reply_json(
            f.router
                .dispatch(r#"AUTH_REQUEST:{"client_id":"app"}"#, client)
                .await,
        );
        assert_eq!(challenge["status"], "CHALLENGE_REQUIRED");
        let challenge = challenge["challenge"].as_str().unwrap().to_string();

        let response =
            challenge_response(&EnvelopeKey::from_passphrase("K"), &challenge, "app").unwrap();
        let message = format!(
            "AUTH_RESPONSE:{}",
            json!({"client_id": "app", "challenge": challenge, "response": response})
        );
        let authenticated = reply_json(f.router.dispatch(&message, client).await);
        assert_eq!(authenticated["status"], "AUTHENTICATED");
        let key = authenticated["session_key"].as_str().unwrap();

        let logout = f
            .router
            .dispatch(&format!("LOGOUT:session_key={key}"), client)
            .await;
        assert!(matches!(logout, RouteOutcome::Reply(_)));
        assert_eq!(f.sessions.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_auth_without_client_id_uses_default() {
        let f = fixture();
        let client = from("10.0.0.9:5000");

        for request in ["AUTH_REQUEST", "AUTH_REQUEST:{}"] {
            let reply = reply_json(f.router.dispatch(request, client).await);
            assert_eq!(reply["status"], "CHALLENGE_REQUIRED");
        }
        let info = f.sessions.client_info(client.socket_addr().unwrap().ip()).await.unwrap();
        assert_eq!(info.client_id, DEFAULT_CLIENT_ID);

        let challenge = reply_json(f.router.dispatch("AUTH_REQUEST", client).await);
        let challenge = challenge["challenge"].as_str().unwrap().to_string();
        let response = challenge_response(
            &EnvelopeKey::from_passphrase("K"),
            &challenge,
            DEFAULT_CLIENT_ID,
        )
        .unwrap();
        let message = format!(
            "AUTH_RESPONSE:{}",
            json!({"challenge": challenge, "response": response})
        );
        let reply = reply_json(f.router.dispatch(&message, client).await);
        assert_eq!(reply["status"], "AUTHENTICATED");

        let reply = reply_json(f.router.dispatch("AUTH_REQUEST:not json", client).await);
        assert_eq!(reply["status"], "AUTH_ERROR");
    }

    #[tokio::test]
    async fn test_bad_auth_response_fails() {
        let f = fixture();
        let client = from("10.0.0.9:5000");
        f.router
            .dispatch(r#"AUTH_REQUEST:{"client_id":"app"}"#, client)
            .await;

        let reply = reply_json(
            f.router
                .dispatch(
                    r#"AUTH_RESPONSE:{"client_id":"app","challenge":"00","response":"00"}"#,
                    client,
                )
                .await,
        );
        assert_eq!(reply["status"], "AUTH_FAILED");

        let reply = reply_json(f.router.dispatch("AUTH_RESPONSE:garbage", client).await);
        assert_eq!(reply["status"], "AUTH_FAILED");
    }

    #[tokio::test]
    async fn test_link_handlers_answer_hub() {
        let sessions = Arc::new(SessionAuthenticator::new(
            EnvelopeKey::from_passphrase("K"),
            Duration::from_secs(300),
        ));
        let router = MessageRouter::new(sessions);
        let identity = Arc::new(DeviceInfo::new("D1", "Bin-1"));
        register_link_handlers(&router, &identity);

        let hub = from("10.0.0.1:8888");
        let RouteOutcome::Reply(heartbeat) = router.dispatch(HEARTBEAT_REQUEST, hub).await else {
            panic!("no heartbeat");
        };
        assert!(heartbeat.starts_with("HEARTBEAT:{"));
        assert!(heartbeat.contains("\"device_id\":\"D1\""));

        let RouteOutcome::Reply(register) = router.dispatch(SERVER_ONLINE, hub).await else {
            panic!("no registration");
        };
        assert!(register.starts_with("DEVICE_REGISTER:"));
    }

    #[test]
    fn test_auth_required_reply() {
        let reply: serde_json::Value = serde_json::from_str(&auth_required_reply()).unwrap();
        assert_eq!(reply["status"], "AUTH_REQUIRED");
    }
}
