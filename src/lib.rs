//! A durable, at-least-once pub/sub delivery engine backed by SQLite.
//!
//! Publishers hand events to a [`Hub`], which enqueues them through a
//! batching [`Writer`] onto persistent storage. Each subscribed session runs
//! its own polling [`Subscriber`], replaying everything it hasn't yet seen
//! and invoking the session's registered callbacks in order. A [`Sweeper`]
//! reclaims old rows once they've aged past their retention window.

mod config;
mod error;
mod hub;
mod message;
mod store;
mod subscriber;
mod sweeper;
mod telemetry;
mod writer;

pub use config::PubsubConfig;
pub use error::PubsubError;
pub use hub::Hub;
pub use message::{DeliveredEvent, Message, NewMessage};
pub use store::Store;
pub use subscriber::{Callback, Subscriber};
pub use sweeper::Sweeper;
pub use telemetry::init_tracing;
pub use writer::Writer;
