//! Higher-level protocol tasks driven by the dispatcher: the
//! authentication handshake and channel subscriptions.

pub mod authenticator;
pub mod subscriber;

pub use authenticator::{AuthState, AuthenticationListener, Authenticator};
pub use subscriber::{Subscriber, SubscriptionListener};
