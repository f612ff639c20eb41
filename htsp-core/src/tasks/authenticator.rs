//! The `hello` / `authenticate` handshake.
//!
//! The authenticator is a connection listener: every time the engine
//! reaches Connected it runs the handshake, and higher-level tasks
//! key off the resulting authentication state. TVHeadend's scheme is
//! challenge/response: the server sends a binary challenge in the
//! `hello` reply and the client answers with
//! `SHA1(password ∥ challenge)`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use sha1::{Digest, Sha1};

use crate::config::ClientConfig;
use crate::connection::{ConnectionListener, ConnectionState};
use crate::dispatcher::HtspMessageDispatcher;
use crate::error::HtspError;
use crate::handler::{Handler, ListenerSet};
use crate::message::HtspMessage;

// ── AuthState ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No handshake attempted on the current connection.
    Idle,
    /// Handshake in flight.
    Authenticating,
    /// Server accepted the credentials.
    Authenticated,
    /// Server denied access. Terminal until credentials change.
    Failed,
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Authenticating => "Authenticating",
            Self::Authenticated => "Authenticated",
            Self::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

// ── AuthenticationListener ───────────────────────────────────────

/// Observes authentication state changes.
pub trait AuthenticationListener: Send + Sync {
    fn handler(&self) -> Option<Handler> {
        None
    }

    fn on_authentication_state(&self, state: AuthState);
}

// ── ServerInfo ───────────────────────────────────────────────────

/// Capabilities the server advertised in its `hello` reply.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub htsp_version: i64,
    pub server_name: String,
    pub server_version: String,
}

// ── Authenticator ────────────────────────────────────────────────

pub struct Authenticator {
    config: ClientConfig,
    dispatcher: Arc<HtspMessageDispatcher>,
    state: Mutex<AuthState>,
    listeners: ListenerSet<dyn AuthenticationListener>,
    server_info: Mutex<Option<ServerInfo>>,
    weak_self: Mutex<Weak<Authenticator>>,
}

impl Authenticator {
    pub fn new(config: ClientConfig, dispatcher: Arc<HtspMessageDispatcher>) -> Arc<Self> {
        let authenticator = Arc::new(Self {
            config,
            dispatcher,
            state: Mutex::new(AuthState::Idle),
            listeners: ListenerSet::new(),
            server_info: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *authenticator.weak_self.lock().unwrap() = Arc::downgrade(&authenticator);
        authenticator
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock().unwrap()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    /// Server details from the last completed `hello` exchange.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().unwrap().clone()
    }

    pub fn add_authentication_listener(&self, listener: Arc<dyn AuthenticationListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_authentication_listener(&self, listener: &Arc<dyn AuthenticationListener>) {
        self.listeners.remove(listener);
    }

    /// The challenge/response digest: `SHA1(password ∥ challenge)`.
    pub fn digest(password: &str, challenge: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(password.as_bytes());
        hasher.update(challenge);
        hasher.finalize().to_vec()
    }

    // ── Handshake ─────────────────────────────────────────────────

    async fn handshake(self: Arc<Self>) {
        match self.run_handshake().await {
            Ok(()) => {
                tracing::info!("authenticated");
                self.set_state(AuthState::Authenticated);
            }
            Err(HtspError::AuthFailed) => {
                tracing::error!("server denied access");
                self.set_state(AuthState::Failed);
            }
            Err(e) => {
                // The connection went away mid-handshake; the next
                // Connected transition retries from scratch.
                tracing::warn!(error = %e, "authentication handshake aborted");
                self.set_state(AuthState::Idle);
            }
        }
    }

    async fn run_handshake(&self) -> Result<(), HtspError> {
        let timeout = self.config.reply_timeout();

        let mut hello = HtspMessage::request("hello");
        hello.put("htspversion", self.config.htsp_version);
        hello.put("clientname", self.config.client_name.as_str());
        hello.put("clientversion", self.config.client_version.as_str());

        let reply = self.dispatcher.request(hello, timeout).await?;
        let challenge = reply.require_bin("challenge")?.clone();

        *self.server_info.lock().unwrap() = Some(ServerInfo {
            htsp_version: reply.get_i64_or("htspversion", 0),
            server_name: reply.get_str_or("servername", "").to_owned(),
            server_version: reply.get_str_or("serverversion", "").to_owned(),
        });

        let mut authenticate = HtspMessage::request("authenticate");
        authenticate.put("username", self.config.username.as_str());
        authenticate.put("digest", Self::digest(&self.config.password, &challenge));

        let reply = self.dispatcher.request(authenticate, timeout).await?;
        if reply.get_i64_or("noaccess", 0) != 0 {
            return Err(HtspError::AuthFailed);
        }
        Ok(())
    }

    fn set_state(&self, state: AuthState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state {
                return;
            }
            tracing::debug!(from = %current, to = %state, "authentication state change");
            *current = state;
        }

        for listener in self.listeners.snapshot() {
            match listener.handler() {
                Some(handler) => {
                    let listener = listener.clone();
                    handler.post(Box::new(move || listener.on_authentication_state(state)));
                }
                None => {
                    let delivery = catch_unwind(AssertUnwindSafe(|| {
                        listener.on_authentication_state(state)
                    }));
                    if delivery.is_err() {
                        tracing::error!("authentication listener panicked, continuing");
                    }
                }
            }
        }
    }
}

impl ConnectionListener for Authenticator {
    fn on_connection_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.set_state(AuthState::Authenticating);
                if let Some(authenticator) = self.weak_self.lock().unwrap().upgrade() {
                    tokio::spawn(authenticator.handshake());
                }
            }
            ConnectionState::Closed | ConnectionState::Failed => {
                self.server_info.lock().unwrap().take();
                self.set_state(AuthState::Idle);
            }
            _ => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const CHALLENGE: &[u8] = &[0x00, 0x01, 0x02, 0x03];

    fn setup() -> (
        Arc<Authenticator>,
        Arc<HtspMessageDispatcher>,
        mpsc::UnboundedReceiver<HtspMessage>,
    ) {
        let dispatcher = Arc::new(HtspMessageDispatcher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.attach(tx);

        let config = ClientConfig {
            username: "dev".into(),
            password: "dev".into(),
            ..Default::default()
        };
        let authenticator = Authenticator::new(config, dispatcher.clone());
        (authenticator, dispatcher, rx)
    }

    async fn wait_for(authenticator: &Authenticator, state: AuthState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while authenticator.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {state}"));
    }

    fn reply_to(request: &HtspMessage) -> HtspMessage {
        let mut reply = HtspMessage::new();
        reply.put("seq", request.seq().unwrap());
        reply
    }

    #[tokio::test]
    async fn handshake_reaches_authenticated() {
        let (authenticator, dispatcher, mut rx) = setup();

        authenticator.on_connection_state(ConnectionState::Connected);
        assert_eq!(authenticator.state(), AuthState::Authenticating);

        // hello carries our identity and protocol version.
        let hello = rx.recv().await.unwrap();
        assert_eq!(hello.method(), Some("hello"));
        assert_eq!(hello.get_i64("htspversion"), Some(26));
        assert_eq!(hello.get_str("clientname"), Some("htsp-core"));

        let mut reply = reply_to(&hello);
        reply.put("challenge", CHALLENGE.to_vec());
        reply.put("servername", "Tvheadend");
        reply.put("serverversion", "4.3");
        reply.put("htspversion", 34);
        dispatcher.on_message(reply);

        // authenticate must carry the username and the exact 20-byte
        // digest of password ∥ challenge.
        let authenticate = rx.recv().await.unwrap();
        assert_eq!(authenticate.method(), Some("authenticate"));
        assert_eq!(authenticate.get_str("username"), Some("dev"));
        let digest = authenticate.get_bin("digest").unwrap();
        assert_eq!(digest.len(), 20);
        assert_eq!(digest.as_ref(), Authenticator::digest("dev", CHALLENGE));

        dispatcher.on_message(reply_to(&authenticate));
        wait_for(&authenticator, AuthState::Authenticated).await;

        let info = authenticator.server_info().unwrap();
        assert_eq!(info.server_name, "Tvheadend");
        assert_eq!(info.htsp_version, 34);
    }

    #[tokio::test]
    async fn noaccess_means_failed() {
        let (authenticator, dispatcher, mut rx) = setup();
        authenticator.on_connection_state(ConnectionState::Connected);

        let hello = rx.recv().await.unwrap();
        let mut reply = reply_to(&hello);
        reply.put("challenge", CHALLENGE.to_vec());
        dispatcher.on_message(reply);

        let authenticate = rx.recv().await.unwrap();
        let mut reply = reply_to(&authenticate);
        reply.put("noaccess", 1);
        dispatcher.on_message(reply);

        wait_for(&authenticator, AuthState::Failed).await;
    }

    #[tokio::test]
    async fn missing_challenge_aborts_to_idle() {
        let (authenticator, dispatcher, mut rx) = setup();
        authenticator.on_connection_state(ConnectionState::Connected);

        let hello = rx.recv().await.unwrap();
        dispatcher.on_message(reply_to(&hello));

        wait_for(&authenticator, AuthState::Idle).await;
    }

    #[tokio::test]
    async fn closed_resets_to_idle() {
        let (authenticator, dispatcher, mut rx) = setup();
        authenticator.on_connection_state(ConnectionState::Connected);

        let hello = rx.recv().await.unwrap();
        let mut reply = reply_to(&hello);
        reply.put("challenge", CHALLENGE.to_vec());
        dispatcher.on_message(reply);

        let authenticate = rx.recv().await.unwrap();
        dispatcher.on_message(reply_to(&authenticate));
        wait_for(&authenticator, AuthState::Authenticated).await;

        authenticator.on_connection_state(ConnectionState::Closed);
        assert_eq!(authenticator.state(), AuthState::Idle);
        assert!(authenticator.server_info().is_none());
    }

    #[tokio::test]
    async fn listeners_observe_state_changes() {
        struct Log(Mutex<Vec<AuthState>>);
        impl AuthenticationListener for Log {
            fn on_authentication_state(&self, state: AuthState) {
                self.0.lock().unwrap().push(state);
            }
        }

        let (authenticator, dispatcher, mut rx) = setup();
        let log = Arc::new(Log(Mutex::new(Vec::new())));
        authenticator.add_authentication_listener(log.clone());

        authenticator.on_connection_state(ConnectionState::Connected);
        let hello = rx.recv().await.unwrap();
        let mut reply = reply_to(&hello);
        reply.put("challenge", CHALLENGE.to_vec());
        dispatcher.on_message(reply);
        let authenticate = rx.recv().await.unwrap();
        dispatcher.on_message(reply_to(&authenticate));
        wait_for(&authenticator, AuthState::Authenticated).await;

        assert_eq!(
            *log.0.lock().unwrap(),
            vec![AuthState::Authenticating, AuthState::Authenticated]
        );
    }
}
