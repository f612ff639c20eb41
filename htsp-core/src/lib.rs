//! An asynchronous HTSP (Home Tv Streaming Protocol) client core for
//! TVHeadend.
//!
//! One persistent TCP connection carries typed request/response
//! traffic with sequence correlation plus asynchronous events, and
//! many logical consumers (authentication, channel subscriptions,
//! application listeners) are multiplexed onto it. The
//! [`SimpleHtspConnection`] supervisor composes the pieces and
//! reconnects with backoff when the link drops:
//!
//! ```no_run
//! use htsp_core::{ClientConfig, SimpleHtspConnection};
//!
//! # async fn run() {
//! let config = ClientConfig {
//!     hostname: "tvheadend.local".into(),
//!     username: "dev".into(),
//!     password: "dev".into(),
//!     ..Default::default()
//! };
//! let connection = SimpleHtspConnection::new(config);
//! connection.start();
//! # }
//! ```

mod backoff;
mod codec;
mod config;
mod connection;
mod dispatcher;
mod error;
mod handler;
mod message;
mod simple;
mod tasks;

pub use backoff::ExponentialBackoff;
pub use codec::{decode_body, encode_frame, HtspCodec, MAX_FRAME_SIZE};
pub use config::{BackoffConfig, ClientConfig};
pub use connection::{ConnectionListener, ConnectionState, HtspConnection};
pub use dispatcher::{HtspMessageDispatcher, MessageListener};
pub use error::HtspError;
pub use handler::{Handler, ListenerSet};
pub use message::{HtspMessage, HtspValue};
pub use simple::SimpleHtspConnection;
pub use tasks::authenticator::{AuthState, AuthenticationListener, Authenticator, ServerInfo};
pub use tasks::subscriber::{Subscriber, SubscriptionListener};
