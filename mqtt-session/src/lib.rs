//! MQTT 3.1.1 client session engine: a cooperative, single-threaded state
//! machine over an abstract [`transport::Transport`] that tracks in-flight
//! messages, matches incoming PUBLISH packets against local subscriptions,
//! and paces outbound traffic with keep-alive and throttling.
//!
//! [`Session`] itself is the entry point; everything else is the machinery
//! behind it.

#![forbid(unsafe_code)]

mod error;
mod io_loop;
mod message;
mod queue;
mod session;
mod state_machine;
mod subscription;
mod throttle;
mod transport;

pub use error::{Error, Result};
pub use message::WaitMask;
pub use session::{Event, Session, CLIENT_ID_MAX_LEN, PASSWORD_MAX_LEN, USERNAME_MAX_LEN, WILL_TOPIC_MAX_LEN};
pub use subscription::{Callback, MessageView};
pub use transport::{Clock, InlineSpawner, Spawner, SystemClock, Transport};
