//! A channel subscription multiplexed onto the shared connection.
//!
//! Each subscriber filters the message stream down to its own
//! `subscriptionId`, forwards the subscription event family to its
//! listener, keeps the latest queue/signal/timeshift status for a
//! periodic stats log, and transparently re-subscribes after a
//! reconnect once authentication completes.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::dispatcher::{HtspMessageDispatcher, MessageListener};
use crate::error::HtspError;
use crate::message::HtspMessage;
use crate::tasks::authenticator::{AuthState, AuthenticationListener};

const INVALID_SUBSCRIPTION_ID: i64 = -1;
const STATS_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_TIMESHIFT_PERIOD: i64 = 0;

/// Methods this task consumes from the shared stream.
const HANDLED_METHODS: [&str; 9] = [
    "subscriptionStart",
    "subscriptionStatus",
    "subscriptionStop",
    "subscriptionSkip",
    "subscriptionSpeed",
    "queueStatus",
    "signalStatus",
    "timeshiftStatus",
    "muxpkt",
];

// ── SubscriptionListener ─────────────────────────────────────────

/// Receives the events of one subscription. All callbacks default to
/// no-ops so implementors only handle what they need.
#[allow(unused_variables)]
pub trait SubscriptionListener: Send + Sync {
    fn on_subscription_start(&self, message: &HtspMessage) {}
    fn on_subscription_status(&self, message: &HtspMessage) {}
    fn on_subscription_stop(&self, message: &HtspMessage) {}
    fn on_subscription_skip(&self, message: &HtspMessage) {}
    fn on_subscription_speed(&self, message: &HtspMessage) {}
    fn on_queue_status(&self, message: &HtspMessage) {}
    fn on_signal_status(&self, message: &HtspMessage) {}
    fn on_timeshift_status(&self, message: &HtspMessage) {}
    fn on_muxpkt(&self, message: &HtspMessage) {}
}

// ── Subscriber ───────────────────────────────────────────────────

/// Remembered parameters of the active subscription, used verbatim
/// when re-subscribing after a reconnect.
#[derive(Debug, Clone)]
struct SubscribeParams {
    channel_id: i64,
    profile: Option<String>,
    timeshift_period: i64,
}

pub struct Subscriber {
    dispatcher: Arc<HtspMessageDispatcher>,
    listener: Arc<dyn SubscriptionListener>,
    subscription_id: i64,
    reply_timeout: Duration,
    is_subscribed: AtomicBool,
    params: Mutex<Option<SubscribeParams>>,
    /// Timeshift period granted by the server on the last subscribe.
    timeshift_period: AtomicI64,
    queue_status: Mutex<Option<HtspMessage>>,
    signal_status: Mutex<Option<HtspMessage>>,
    timeshift_status: Mutex<Option<HtspMessage>>,
    stats_task: Mutex<Option<CancellationToken>>,
    weak_self: Mutex<Weak<Subscriber>>,
}

impl Subscriber {
    /// Bind a subscriber to the dispatcher. `subscription_id` must be
    /// unique among live subscribers on this connection; the
    /// supervisor's `new_subscriber` allocates one.
    pub fn new(
        dispatcher: Arc<HtspMessageDispatcher>,
        listener: Arc<dyn SubscriptionListener>,
        subscription_id: i64,
        reply_timeout: Duration,
    ) -> Arc<Self> {
        let subscriber = Arc::new(Self {
            dispatcher,
            listener,
            subscription_id,
            reply_timeout,
            is_subscribed: AtomicBool::new(false),
            params: Mutex::new(None),
            timeshift_period: AtomicI64::new(DEFAULT_TIMESHIFT_PERIOD),
            queue_status: Mutex::new(None),
            signal_status: Mutex::new(None),
            timeshift_status: Mutex::new(None),
            stats_task: Mutex::new(None),
            weak_self: Mutex::new(Weak::new()),
        });
        *subscriber.weak_self.lock().unwrap() = Arc::downgrade(&subscriber);
        subscriber
    }

    pub fn subscription_id(&self) -> i64 {
        self.subscription_id
    }

    pub fn is_subscribed(&self) -> bool {
        self.is_subscribed.load(Ordering::SeqCst)
    }

    /// Timeshift period the server granted, in seconds.
    pub fn timeshift_period(&self) -> i64 {
        self.timeshift_period.load(Ordering::SeqCst)
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Subscribe to a channel and await the server's confirmation.
    pub async fn subscribe(
        self: &Arc<Self>,
        channel_id: i64,
        profile: Option<&str>,
        timeshift_period: i64,
    ) -> Result<(), HtspError> {
        tracing::info!(
            subscription_id = self.subscription_id,
            channel_id,
            "requesting subscription"
        );

        if !self.is_subscribed() {
            self.dispatcher
                .add_message_listener(self.clone() as Arc<dyn MessageListener>);
        }

        *self.params.lock().unwrap() = Some(SubscribeParams {
            channel_id,
            profile: profile.map(str::to_owned),
            timeshift_period,
        });

        let mut request = HtspMessage::request("subscribe");
        request.put("subscriptionId", self.subscription_id);
        request.put("channelId", channel_id);
        request.put("timeshiftPeriod", timeshift_period);
        if let Some(profile) = profile {
            request.put("profile", profile);
        }

        let reply = self.dispatcher.request(request, self.reply_timeout).await?;

        let granted = reply.get_i64_or("timeshiftPeriod", 0);
        self.timeshift_period.store(granted, Ordering::SeqCst);
        if let Some(params) = self.params.lock().unwrap().as_mut() {
            // Re-subscribes ask for what the server actually granted.
            params.timeshift_period = granted;
        }
        tracing::info!(timeshift_period = granted, "subscription established");

        self.is_subscribed.store(true, Ordering::SeqCst);
        self.start_stats_task();
        Ok(())
    }

    /// End the subscription.
    ///
    /// The message listener is removed *before* the `unsubscribe`
    /// request is sent, so a late `subscriptionStop` from the server
    /// is not delivered to the listener.
    pub fn unsubscribe(self: &Arc<Self>) {
        tracing::info!(subscription_id = self.subscription_id, "unsubscribing");

        self.cancel_stats_task();
        self.is_subscribed.store(false, Ordering::SeqCst);
        self.dispatcher
            .remove_message_listener(&(self.clone() as Arc<dyn MessageListener>));

        let mut request = HtspMessage::request("unsubscribe");
        request.put("subscriptionId", self.subscription_id);
        // Not connected means TVHeadend has already dropped us.
        let _ = self.dispatcher.send(request);
    }

    // ── Playback control ──────────────────────────────────────────

    pub fn set_speed(&self, speed: i64) {
        let mut request = HtspMessage::request("subscriptionSpeed");
        request.put("subscriptionId", self.subscription_id);
        request.put("speed", speed);
        let _ = self.dispatcher.send(request);
    }

    pub fn pause(&self) {
        self.set_speed(0);
    }

    pub fn resume(&self) {
        self.set_speed(100);
    }

    pub fn skip(&self, time: i64) {
        let mut request = HtspMessage::request("subscriptionSkip");
        request.put("subscriptionId", self.subscription_id);
        request.put("time", time);
        let _ = self.dispatcher.send(request);
    }

    pub fn live(&self) {
        let mut request = HtspMessage::request("subscriptionLive");
        request.put("subscriptionId", self.subscription_id);
        let _ = self.dispatcher.send(request);
    }

    // ── Stats logging ─────────────────────────────────────────────

    fn start_stats_task(self: &Arc<Self>) {
        self.cancel_stats_task();

        let token = CancellationToken::new();
        *self.stats_task.lock().unwrap() = Some(token.clone());

        let subscriber = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(STATS_INTERVAL) => {
                        match subscriber.upgrade() {
                            Some(subscriber) => subscriber.log_stats(),
                            None => break,
                        }
                    }
                }
            }
        });
    }

    fn cancel_stats_task(&self) {
        if let Some(token) = self.stats_task.lock().unwrap().take() {
            token.cancel();
        }
    }

    fn log_stats(&self) {
        if let Some(status) = self.queue_status.lock().unwrap().as_ref() {
            tracing::info!(
                "Queue Status: S: {} P: {} B: {} E: {} D: {} bD: {} pD: {} iD: {}",
                status.get_i64_or("subscriptionId", INVALID_SUBSCRIPTION_ID),
                status.get_i64_or("packets", 0),
                status.get_i64_or("bytes", 0),
                status.get_i64_or("errors", 0),
                status.get_i64_or("delay", 0),
                status.get_i64_or("Bdrops", 0),
                status.get_i64_or("Pdrops", 0),
                status.get_i64_or("Idrops", 0),
            );
        }

        if let Some(status) = self.signal_status.lock().unwrap().as_ref() {
            tracing::info!(
                "Signal Status: S: {} feStatus: {} feSNR: {} feSignal: {} feBER: {} feUNC: {}",
                status.get_i64_or("subscriptionId", INVALID_SUBSCRIPTION_ID),
                status.get_str_or("feStatus", "?"),
                status.get_i64_or("feSNR", -1),
                status.get_i64_or("feSignal", -1),
                status.get_i64_or("feBER", -1),
                status.get_i64_or("feUNC", -1),
            );
        }

        if let Some(status) = self.timeshift_status.lock().unwrap().as_ref() {
            tracing::info!(
                "Timeshift Status: S: {} full: {} shift: {} start: {} end: {}",
                status.get_i64_or("subscriptionId", INVALID_SUBSCRIPTION_ID),
                status.get_i64_or("full", 0),
                status.get_i64_or("shift", 0),
                status.get_i64_or("start", -1),
                status.get_i64_or("end", -1),
            );
        }
    }
}

impl MessageListener for Subscriber {
    fn on_message(&self, message: &HtspMessage) {
        let Some(method) = message.method() else {
            return;
        };
        if !HANDLED_METHODS.contains(&method) {
            return;
        }
        // Another subscription's traffic: drop silently.
        if message.get_i64_or("subscriptionId", INVALID_SUBSCRIPTION_ID) != self.subscription_id {
            return;
        }

        match method {
            "subscriptionStart" => self.listener.on_subscription_start(message),
            "subscriptionStatus" => {
                if let Some(error) = message.get_str("subscriptionError") {
                    tracing::warn!(
                        subscription_id = self.subscription_id,
                        status = message.get_str_or("status", ""),
                        error,
                        "subscription status"
                    );
                }
                self.listener.on_subscription_status(message);
            }
            "subscriptionStop" => {
                self.cancel_stats_task();
                self.listener.on_subscription_stop(message);
            }
            "subscriptionSkip" => self.listener.on_subscription_skip(message),
            "subscriptionSpeed" => self.listener.on_subscription_speed(message),
            "queueStatus" => {
                *self.queue_status.lock().unwrap() = Some(message.clone());
                self.listener.on_queue_status(message);
            }
            "signalStatus" => {
                *self.signal_status.lock().unwrap() = Some(message.clone());
                self.listener.on_signal_status(message);
            }
            "timeshiftStatus" => {
                *self.timeshift_status.lock().unwrap() = Some(message.clone());
                self.listener.on_timeshift_status(message);
            }
            "muxpkt" => self.listener.on_muxpkt(message),
            _ => {}
        }
    }
}

impl AuthenticationListener for Subscriber {
    fn on_authentication_state(&self, state: AuthState) {
        match state {
            AuthState::Authenticated if self.is_subscribed() => {
                let Some(params) = self.params.lock().unwrap().clone() else {
                    return;
                };
                let Some(subscriber) = self.weak_self.lock().unwrap().upgrade() else {
                    return;
                };
                tracing::warn!(
                    subscription_id = self.subscription_id,
                    channel_id = params.channel_id,
                    "resubscribing after reconnect"
                );
                tokio::spawn(async move {
                    let result = subscriber
                        .subscribe(
                            params.channel_id,
                            params.profile.as_deref(),
                            params.timeshift_period,
                        )
                        .await;
                    if let Err(e) = result {
                        tracing::error!(error = %e, "resubscription failed");
                    }
                });
            }
            AuthState::Idle | AuthState::Failed => {
                // Connection is gone; stop logging stale stats.
                self.cancel_stats_task();
            }
            _ => {}
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel_stats_task();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        muxpkts: Mutex<Vec<HtspMessage>>,
        stops: Mutex<Vec<HtspMessage>>,
        starts: Mutex<Vec<HtspMessage>>,
    }

    impl SubscriptionListener for Recorder {
        fn on_subscription_start(&self, message: &HtspMessage) {
            self.starts.lock().unwrap().push(message.clone());
        }
        fn on_subscription_stop(&self, message: &HtspMessage) {
            self.stops.lock().unwrap().push(message.clone());
        }
        fn on_muxpkt(&self, message: &HtspMessage) {
            self.muxpkts.lock().unwrap().push(message.clone());
        }
    }

    fn setup() -> (
        Arc<HtspMessageDispatcher>,
        mpsc::UnboundedReceiver<HtspMessage>,
    ) {
        let dispatcher = Arc::new(HtspMessageDispatcher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.attach(tx);
        (dispatcher, rx)
    }

    fn subscriber_with_id(
        dispatcher: &Arc<HtspMessageDispatcher>,
        id: i64,
    ) -> (Arc<Subscriber>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let subscriber = Subscriber::new(
            dispatcher.clone(),
            recorder.clone(),
            id,
            Duration::from_secs(5),
        );
        (subscriber, recorder)
    }

    /// Drive one subscribe call to completion against a scripted
    /// reply.
    async fn complete_subscribe(
        dispatcher: &Arc<HtspMessageDispatcher>,
        rx: &mut mpsc::UnboundedReceiver<HtspMessage>,
        subscriber: &Arc<Subscriber>,
        channel_id: i64,
        granted_timeshift: i64,
    ) {
        let task = {
            let subscriber = subscriber.clone();
            tokio::spawn(async move { subscriber.subscribe(channel_id, None, 0).await })
        };

        let request = rx.recv().await.unwrap();
        assert_eq!(request.method(), Some("subscribe"));
        assert_eq!(request.get_i64("channelId"), Some(channel_id));

        let mut reply = HtspMessage::new();
        reply.put("seq", request.seq().unwrap());
        reply.put("timeshiftPeriod", granted_timeshift);
        dispatcher.on_message(reply);

        task.await.unwrap().unwrap();
    }

    fn event_for(method: &str, subscription_id: i64) -> HtspMessage {
        let mut message = HtspMessage::request(method);
        message.put("subscriptionId", subscription_id);
        message
    }

    #[tokio::test]
    async fn subscribe_reads_back_granted_timeshift() {
        let (dispatcher, mut rx) = setup();
        let (subscriber, _) = subscriber_with_id(&dispatcher, 1);

        complete_subscribe(&dispatcher, &mut rx, &subscriber, 7, 3600).await;

        assert!(subscriber.is_subscribed());
        assert_eq!(subscriber.timeshift_period(), 3600);
    }

    #[tokio::test]
    async fn filters_by_subscription_id() {
        let (dispatcher, mut rx) = setup();
        let (subscriber_a, recorder_a) = subscriber_with_id(&dispatcher, 1);
        let (subscriber_b, recorder_b) = subscriber_with_id(&dispatcher, 2);

        complete_subscribe(&dispatcher, &mut rx, &subscriber_a, 7, 0).await;
        complete_subscribe(&dispatcher, &mut rx, &subscriber_b, 9, 0).await;

        dispatcher.on_message(event_for("muxpkt", 1));

        assert_eq!(recorder_a.muxpkts.lock().unwrap().len(), 1);
        assert!(recorder_b.muxpkts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignores_unhandled_methods_and_foreign_ids() {
        let (dispatcher, mut rx) = setup();
        let (subscriber, recorder) = subscriber_with_id(&dispatcher, 1);
        complete_subscribe(&dispatcher, &mut rx, &subscriber, 7, 0).await;

        // Unhandled method, matching id.
        dispatcher.on_message(event_for("channelAdd", 1));
        // Handled method, foreign id.
        dispatcher.on_message(event_for("subscriptionStart", 99));
        // Handled method, no id at all.
        dispatcher.on_message(HtspMessage::request("subscriptionStart"));

        assert!(recorder.starts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_removes_listener_before_sending() {
        let (dispatcher, mut rx) = setup();
        let (subscriber, recorder) = subscriber_with_id(&dispatcher, 1);
        complete_subscribe(&dispatcher, &mut rx, &subscriber, 7, 0).await;

        subscriber.unsubscribe();
        assert!(!subscriber.is_subscribed());

        let request = rx.recv().await.unwrap();
        assert_eq!(request.method(), Some("unsubscribe"));
        assert_eq!(request.get_i64("subscriptionId"), Some(1));

        // A late stop from the server is no longer delivered.
        dispatcher.on_message(event_for("subscriptionStop", 1));
        assert!(recorder.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_tolerates_not_connected() {
        let dispatcher = Arc::new(HtspMessageDispatcher::new());
        let (subscriber, _) = subscriber_with_id(&dispatcher, 1);
        // No engine attached; must not error or panic.
        subscriber.unsubscribe();
        subscriber.set_speed(100);
        subscriber.skip(30);
        subscriber.live();
    }

    #[tokio::test]
    async fn playback_controls_carry_subscription_id() {
        let (dispatcher, mut rx) = setup();
        let (subscriber, _) = subscriber_with_id(&dispatcher, 5);
        complete_subscribe(&dispatcher, &mut rx, &subscriber, 7, 0).await;

        subscriber.pause();
        subscriber.resume();
        subscriber.skip(120);
        subscriber.live();

        let pause = rx.recv().await.unwrap();
        assert_eq!(pause.method(), Some("subscriptionSpeed"));
        assert_eq!(pause.get_i64("speed"), Some(0));
        assert_eq!(pause.get_i64("subscriptionId"), Some(5));

        let resume = rx.recv().await.unwrap();
        assert_eq!(resume.get_i64("speed"), Some(100));

        let skip = rx.recv().await.unwrap();
        assert_eq!(skip.method(), Some("subscriptionSkip"));
        assert_eq!(skip.get_i64("time"), Some(120));

        let live = rx.recv().await.unwrap();
        assert_eq!(live.method(), Some("subscriptionLive"));
    }

    #[tokio::test]
    async fn resubscribes_once_on_authenticated() {
        let (dispatcher, mut rx) = setup();
        let (subscriber, _) = subscriber_with_id(&dispatcher, 1);
        complete_subscribe(&dispatcher, &mut rx, &subscriber, 7, 3600).await;

        // Connection drops and comes back.
        subscriber.on_authentication_state(AuthState::Idle);
        subscriber.on_authentication_state(AuthState::Authenticated);

        let request = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), Some("subscribe"));
        assert_eq!(request.get_i64("channelId"), Some(7));
        assert_eq!(request.get_i64("subscriptionId"), Some(1));
        // Asks for what the server granted last time.
        assert_eq!(request.get_i64("timeshiftPeriod"), Some(3600));

        // Exactly one resubscribe.
        let mut reply = HtspMessage::new();
        reply.put("seq", request.seq().unwrap());
        dispatcher.on_message(reply);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_resubscribe_when_never_subscribed() {
        let (dispatcher, mut rx) = setup();
        let (subscriber, _) = subscriber_with_id(&dispatcher, 1);

        subscriber.on_authentication_state(AuthState::Authenticated);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        let _ = dispatcher;
    }
}
