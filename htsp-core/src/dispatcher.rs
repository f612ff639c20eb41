//! Request/response correlation and message fan-out.
//!
//! The dispatcher sits between callers and the connection engine: it
//! assigns sequence numbers, remembers which method each outstanding
//! `seq` belongs to (replies carry `seq` but no `method`), completes
//! synchronous [`request`](HtspMessageDispatcher::request) calls, and
//! fans incoming messages out to registered listeners.
//!
//! The engine installs an outbound channel on connect and removes it
//! on teardown; the channel's presence is the "connected" predicate
//! for sends, and enqueuing into it wakes the engine's I/O loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::HtspError;
use crate::handler::{Handler, ListenerSet};
use crate::message::HtspMessage;

// ── MessageListener ──────────────────────────────────────────────

/// Receives every message the dispatcher fans out.
///
/// A listener returning `Some` from [`handler`](Self::handler) has its
/// callbacks posted there; otherwise they run inline on the I/O task.
pub trait MessageListener: Send + Sync {
    fn handler(&self) -> Option<Handler> {
        None
    }

    fn on_message(&self, message: &HtspMessage);
}

// ── HtspMessageDispatcher ────────────────────────────────────────

pub struct HtspMessageDispatcher {
    /// Sequence allocator, scoped to this dispatcher instance.
    sequence: AtomicI64,
    /// Outbound queue into the engine; present iff CONNECTED.
    sender: Mutex<Option<mpsc::UnboundedSender<HtspMessage>>>,
    /// seq → originating method, for restoring `method` on replies.
    response_methods: Mutex<HashMap<i64, String>>,
    /// seq → rendezvous for a blocked `request` caller.
    rendezvous: Mutex<HashMap<i64, oneshot::Sender<HtspMessage>>>,
    listeners: ListenerSet<dyn MessageListener>,
}

impl HtspMessageDispatcher {
    pub fn new() -> Self {
        Self {
            sequence: AtomicI64::new(0),
            sender: Mutex::new(None),
            response_methods: Mutex::new(HashMap::new()),
            rendezvous: Mutex::new(HashMap::new()),
            listeners: ListenerSet::new(),
        }
    }

    // ── Listener registry ─────────────────────────────────────────

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) {
        self.listeners.remove(listener);
    }

    // ── Sending ───────────────────────────────────────────────────

    /// Queue a message for sending, fire-and-forget.
    ///
    /// Assigns `seq` if absent and records the method for reply
    /// correlation. Fails with [`HtspError::NotConnected`] when the
    /// engine is not connected; nothing is enqueued in that case.
    pub fn send(&self, mut message: HtspMessage) -> Result<(), HtspError> {
        let guard = self.sender.lock().unwrap();
        let sender = guard.as_ref().ok_or(HtspError::NotConnected)?;

        let seq = self.prepare(&mut message);
        tracing::trace!(seq, method = message.method(), "queueing message");

        if sender.send(message).is_err() {
            self.forget(seq);
            return Err(HtspError::NotConnected);
        }
        Ok(())
    }

    /// Send a request and await its reply.
    ///
    /// The reply is returned with its `method` restored from the
    /// outstanding-request table. On timeout the table entry is
    /// erased; if the connection drops first, the call resolves with
    /// [`HtspError::NotConnected`].
    ///
    /// Must not be awaited from a listener callback running inline on
    /// the I/O task — the reply could never be dispatched.
    pub async fn request(
        &self,
        mut message: HtspMessage,
        timeout: Duration,
    ) -> Result<HtspMessage, HtspError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let seq = {
            let guard = self.sender.lock().unwrap();
            let sender = guard.as_ref().ok_or(HtspError::NotConnected)?;

            let seq = self.prepare(&mut message);
            self.rendezvous.lock().unwrap().insert(seq, reply_tx);

            if sender.send(message).is_err() {
                self.forget(seq);
                return Err(HtspError::NotConnected);
            }
            seq
        };

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Rendezvous dropped by teardown.
            Ok(Err(_)) => Err(HtspError::NotConnected),
            Err(_) => {
                self.forget(seq);
                Err(HtspError::Timeout(timeout))
            }
        }
    }

    /// Assign `seq` (if absent) and record seq → method.
    fn prepare(&self, message: &mut HtspMessage) -> i64 {
        let seq = match message.seq() {
            Some(seq) => seq,
            None => {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                message.put("seq", seq);
                seq
            }
        };
        if let Some(method) = message.method() {
            self.response_methods
                .lock()
                .unwrap()
                .insert(seq, method.to_owned());
        }
        seq
    }

    /// Drop all correlation state for `seq`.
    fn forget(&self, seq: i64) {
        self.response_methods.lock().unwrap().remove(&seq);
        self.rendezvous.lock().unwrap().remove(&seq);
    }

    // ── Receiving ─────────────────────────────────────────────────

    /// Deliver one incoming message: restore `method` on replies,
    /// complete any rendezvous, then fan out to listeners.
    ///
    /// Listener panics are caught and logged; they never take down
    /// the I/O loop.
    pub fn on_message(&self, mut message: HtspMessage) {
        if let Some(seq) = message.seq() {
            // Replies carry the request's seq but no method; restore
            // it from the table before anyone sees the message.
            if let Some(method) = self.response_methods.lock().unwrap().remove(&seq) {
                if !message.contains("method") {
                    message.put("method", method);
                }
            }

            if let Some(waiter) = self.rendezvous.lock().unwrap().remove(&seq) {
                let _ = waiter.send(message.clone());
            }
        }

        for listener in self.listeners.snapshot() {
            match listener.handler() {
                Some(handler) => {
                    let message = message.clone();
                    let listener = listener.clone();
                    handler.post(Box::new(move || listener.on_message(&message)));
                }
                None => {
                    let delivery =
                        catch_unwind(AssertUnwindSafe(|| listener.on_message(&message)));
                    if delivery.is_err() {
                        tracing::error!("message listener panicked, continuing");
                    }
                }
            }
        }
    }

    // ── Engine attachment ─────────────────────────────────────────

    /// Install the outbound queue. Called by the engine once the
    /// socket is connected, before listeners hear about CONNECTED.
    pub(crate) fn attach(&self, sender: mpsc::UnboundedSender<HtspMessage>) {
        *self.sender.lock().unwrap() = Some(sender);
    }

    /// Tear down on CLOSED/FAILED: drop the queue, clear the
    /// outstanding-request table, and wake every blocked `request`
    /// caller with `NotConnected`.
    pub(crate) fn detach(&self) {
        self.sender.lock().unwrap().take();
        self.response_methods.lock().unwrap().clear();
        // Dropping the oneshot senders resolves the waiters.
        self.rendezvous.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.response_methods.lock().unwrap().len()
    }
}

impl Default for HtspMessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        received: Mutex<Vec<HtspMessage>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl MessageListener for Recorder {
        fn on_message(&self, message: &HtspMessage) {
            self.received.lock().unwrap().push(message.clone());
        }
    }

    fn attached() -> (
        Arc<HtspMessageDispatcher>,
        mpsc::UnboundedReceiver<HtspMessage>,
    ) {
        let dispatcher = Arc::new(HtspMessageDispatcher::new());
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.attach(tx);
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn send_assigns_unique_sequence() {
        let (dispatcher, mut rx) = attached();

        dispatcher.send(HtspMessage::request("hello")).unwrap();
        dispatcher.send(HtspMessage::request("getDiskSpace")).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq(), Some(0));
        assert_eq!(second.seq(), Some(1));
        assert_eq!(dispatcher.outstanding(), 2);
    }

    #[tokio::test]
    async fn send_keeps_existing_sequence() {
        let (dispatcher, mut rx) = attached();

        let mut message = HtspMessage::request("hello");
        message.put("seq", 99);
        dispatcher.send(message).unwrap();

        assert_eq!(rx.recv().await.unwrap().seq(), Some(99));
    }

    #[tokio::test]
    async fn send_while_detached_fails() {
        let dispatcher = HtspMessageDispatcher::new();
        let err = dispatcher.send(HtspMessage::request("hello")).unwrap_err();
        assert!(matches!(err, HtspError::NotConnected));
    }

    #[tokio::test]
    async fn request_while_detached_fails_without_enqueuing() {
        let dispatcher = HtspMessageDispatcher::new();
        let err = dispatcher
            .request(HtspMessage::request("hello"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HtspError::NotConnected));
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn request_resolves_with_method_restored() {
        let (dispatcher, mut rx) = attached();

        let caller = dispatcher.clone();
        let call = tokio::spawn(async move {
            caller
                .request(HtspMessage::request("hello"), Duration::from_secs(5))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let seq = sent.seq().unwrap();

        let mut reply = HtspMessage::new();
        reply.put("seq", seq);
        reply.put("htspversion", 26);
        dispatcher.on_message(reply);

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.method(), Some("hello"));
        assert_eq!(reply.get_i64("htspversion"), Some(26));
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn request_times_out_and_erases_entry() {
        let (dispatcher, mut rx) = attached();

        let err = dispatcher
            .request(HtspMessage::request("hello"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HtspError::Timeout(_)));
        assert_eq!(dispatcher.outstanding(), 0);

        // The message itself was still sent.
        assert!(rx.recv().await.unwrap().method() == Some("hello"));
    }

    #[tokio::test]
    async fn detach_wakes_pending_request_with_not_connected() {
        let (dispatcher, mut rx) = attached();

        let caller = dispatcher.clone();
        let call = tokio::spawn(async move {
            caller
                .request(HtspMessage::request("hello"), Duration::from_secs(30))
                .await
        });

        // Wait until the request is on the wire, then drop the link.
        let _ = rx.recv().await.unwrap();
        dispatcher.detach();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, HtspError::NotConnected));
    }

    #[tokio::test]
    async fn fan_out_preserves_arrival_order() {
        let (dispatcher, _rx) = attached();
        let recorder = Recorder::new();
        dispatcher.add_message_listener(recorder.clone());

        for i in 0..5 {
            let mut msg = HtspMessage::request("muxpkt");
            msg.put("frame", i);
            dispatcher.on_message(msg);
        }

        let received = recorder.received.lock().unwrap();
        let frames: Vec<i64> = received.iter().map(|m| m.get_i64("frame").unwrap()).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn method_restored_before_fan_out() {
        let (dispatcher, mut rx) = attached();
        let recorder = Recorder::new();
        dispatcher.add_message_listener(recorder.clone());

        dispatcher.send(HtspMessage::request("subscribe")).unwrap();
        let seq = rx.recv().await.unwrap().seq().unwrap();

        let mut reply = HtspMessage::new();
        reply.put("seq", seq);
        dispatcher.on_message(reply);

        let received = recorder.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].method(), Some("subscribe"));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_fan_out() {
        struct Bomb;
        impl MessageListener for Bomb {
            fn on_message(&self, _: &HtspMessage) {
                panic!("boom");
            }
        }

        let (dispatcher, _rx) = attached();
        dispatcher.add_message_listener(Arc::new(Bomb));
        let recorder = Recorder::new();
        dispatcher.add_message_listener(recorder.clone());

        dispatcher.on_message(HtspMessage::request("subscriptionStatus"));
        assert_eq!(recorder.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn posted_listener_receives_on_handler() {
        struct Posted {
            handler: Handler,
            received: Mutex<Vec<HtspMessage>>,
        }
        impl MessageListener for Posted {
            fn handler(&self) -> Option<Handler> {
                Some(self.handler.clone())
            }
            fn on_message(&self, message: &HtspMessage) {
                self.received.lock().unwrap().push(message.clone());
            }
        }

        let (dispatcher, _rx) = attached();
        let listener = Arc::new(Posted {
            handler: Handler::spawn(),
            received: Mutex::new(Vec::new()),
        });
        dispatcher.add_message_listener(listener.clone());

        dispatcher.on_message(HtspMessage::request("signalStatus"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(listener.received.lock().unwrap().len(), 1);
    }
}
