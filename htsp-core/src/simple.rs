//! The "simple connection": dispatcher, authenticator, and connection
//! engine composed behind one handle, with reconnect-and-backoff.
//!
//! The supervisor owns a controller task that runs one engine at a
//! time. A failed engine is replaced after an exponential-backoff
//! delay; a cleanly closed engine, a stop request, or a credential
//! rejection ends the loop. Listener registrations live here (or in
//! the long-lived dispatcher/authenticator), so they survive across
//! engine replacements.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::{ConnectionListener, ConnectionState, HtspConnection};
use crate::dispatcher::{HtspMessageDispatcher, MessageListener};
use crate::tasks::authenticator::{AuthState, AuthenticationListener, Authenticator};
use crate::tasks::subscriber::{Subscriber, SubscriptionListener};

pub struct SimpleHtspConnection {
    config: ClientConfig,
    dispatcher: Arc<HtspMessageDispatcher>,
    authenticator: Arc<Authenticator>,
    /// Shared with every engine instance so registrations outlive
    /// reconnects.
    connection_listeners: Arc<crate::handler::ListenerSet<dyn ConnectionListener>>,
    current: Mutex<Option<Arc<HtspConnection>>>,
    stop: CancellationToken,
    controller: Mutex<Option<JoinHandle<()>>>,
    /// Set once the server rejects the credentials; suppresses
    /// reconnects even though the auth state resets to Idle on close.
    auth_failed: AtomicBool,
    /// Subscription id allocator, scoped to this supervisor.
    subscription_ids: AtomicI64,
}

/// Internal auth listener that makes a credential rejection fatal:
/// it latches the failure and closes the connection.
struct AuthFailureWatch {
    supervisor: Weak<SimpleHtspConnection>,
}

impl AuthenticationListener for AuthFailureWatch {
    fn on_authentication_state(&self, state: AuthState) {
        if state != AuthState::Failed {
            return;
        }
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.auth_failed.store(true, Ordering::SeqCst);
            if let Some(connection) = supervisor.current.lock().unwrap().clone() {
                connection.close();
            }
        }
    }
}

impl SimpleHtspConnection {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let dispatcher = Arc::new(HtspMessageDispatcher::new());
        let authenticator = Authenticator::new(config.clone(), dispatcher.clone());
        let connection_listeners = Arc::new(crate::handler::ListenerSet::new());

        let supervisor = Arc::new(Self {
            config,
            dispatcher,
            authenticator: authenticator.clone(),
            connection_listeners,
            current: Mutex::new(None),
            stop: CancellationToken::new(),
            controller: Mutex::new(None),
            auth_failed: AtomicBool::new(false),
            subscription_ids: AtomicI64::new(0),
        });

        // The authenticator re-runs its handshake on every Connected.
        supervisor
            .connection_listeners
            .add(authenticator.clone() as Arc<dyn ConnectionListener>);

        authenticator.add_authentication_listener(Arc::new(AuthFailureWatch {
            supervisor: Arc::downgrade(&supervisor),
        }));

        supervisor
    }

    /// Spawn the controller task. Idempotent: a second call while the
    /// controller is alive is ignored.
    pub fn start(self: &Arc<Self>) {
        let mut controller = self.controller.lock().unwrap();
        if controller.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::warn!("already started");
            return;
        }
        let supervisor = self.clone();
        *controller = Some(tokio::spawn(supervisor.run()));
    }

    /// Close the connection and suppress any further reconnects.
    pub fn stop(&self) {
        self.stop.cancel();
        if let Some(connection) = self.current.lock().unwrap().clone() {
            connection.close();
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|connection| connection.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn auth_state(&self) -> AuthState {
        self.authenticator.state()
    }

    pub fn dispatcher(&self) -> &Arc<HtspMessageDispatcher> {
        &self.dispatcher
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.authenticator
    }

    // ── Listener forwarding ───────────────────────────────────────

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.connection_listeners.remove(listener);
    }

    pub fn add_authentication_listener(&self, listener: Arc<dyn AuthenticationListener>) {
        self.authenticator.add_authentication_listener(listener);
    }

    pub fn remove_authentication_listener(&self, listener: &Arc<dyn AuthenticationListener>) {
        self.authenticator.remove_authentication_listener(listener);
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.dispatcher.add_message_listener(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.dispatcher.remove_message_listener(listener);
    }

    // ── Subscriptions ─────────────────────────────────────────────

    /// Create a subscriber with a fresh subscription id, wired for
    /// automatic re-subscription after reconnects.
    pub fn new_subscriber(&self, listener: Arc<dyn SubscriptionListener>) -> Arc<Subscriber> {
        let id = self.subscription_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Subscriber::new(
            self.dispatcher.clone(),
            listener,
            id,
            self.config.reply_timeout(),
        );
        self.authenticator
            .add_authentication_listener(subscriber.clone());
        subscriber
    }

    // ── Controller ────────────────────────────────────────────────

    async fn run(self: Arc<Self>) {
        tracing::debug!("started task 'controller'");
        let mut backoff = self.config.backoff.build();

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            let engine = Arc::new(HtspConnection::new(
                self.config.clone(),
                self.dispatcher.clone(),
                self.connection_listeners.clone(),
            ));
            *self.current.lock().unwrap() = Some(engine.clone());

            // A stop may have raced the engine swap.
            if self.stop.is_cancelled() {
                engine.close();
            }

            let run = engine.start();
            let _ = run.await;

            if engine.ever_connected() {
                backoff.reset();
            }

            match engine.state() {
                ConnectionState::Closed => break,
                _ => {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    if self.auth_failed.load(Ordering::SeqCst) {
                        tracing::error!("authentication failed, giving up on reconnects");
                        break;
                    }

                    let delay = backoff.next_duration();
                    if !delay.is_zero() {
                        tracing::warn!(
                            delay_ms = delay.as_millis() as u64,
                            "connection failed, backing off before reconnect"
                        );
                    }
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!("completed task 'controller'");
    }
}
