//! Session hub: relays one host's envelopes to every joined listener.
//!
//! ## Architecture
//!
//! ```text
//!  host socket ──► forwarder ──broadcast──┬──► listener chan ──► delivery ──► viewer socket
//!       ▲                                 ├──► listener chan ──► delivery ──► viewer socket
//!       │                                 └──► ...
//!       │  RESEND                             │ Unregister (write failed)
//!       └──────── registration loop ◄─────────┘
//!                        ▲
//!                        │ Register (join)
//! ```
//!
//! Each session runs two tasks: the registration loop, which owns the host's
//! write half and applies register/unregister messages in arrival order, and
//! the forwarder, which reads the host and pushes every envelope to every
//! listener. Each listener runs its own delivery task.
//!
//! Listener channels hold a single envelope by default and broadcast waits for
//! room, so a stalled viewer holds up the whole session until it drains or its
//! write fails.

mod error;
mod listener;
mod registry;
mod relay;
mod session;
pub mod transport;

pub use error::HubError;
pub use listener::{DeliveryOutcome, ListenerId, ListenerSubscription};
pub use registry::SessionRegistry;
pub use relay::{Hub, HubConfig};
pub use session::{Session, SessionId, SessionState};
pub use transport::{
    EnvelopeSink, EnvelopeSource, Inbound, TransportError, WsSink, WsSource, split_websocket,
};
