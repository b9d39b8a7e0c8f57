//! eventbuf – the event-delivery buffer of a client SDK.
//!
//! Accepts application-generated events, holds them locally, and hands
//! them off for durable transport to a remote collector. This crate exports
//!  * `core`   – codec, envelope, error types, and the two queue backends
//!  * `broker` – client adapter plus an embeddable topic/channel broker
//!  * `config` – TOML-driven runtime configuration
//!
//! Both backends speak the same four-operation [`EventQueue`] contract:
//! `add` enqueues (publish, for the durable backend), `get` peeks, `remove`
//! dequeues-and-acknowledges, `size` counts. Environments without a broker
//! can use [`InMemoryQueue`] alone, or let [`DurableQueue`] boot the
//! process-wide [`EmbeddedBroker`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::{Broker, BrokerOptions, Consumer, EmbeddedBroker, Producer};
pub use config::{load_config, Config};
pub use core::envelope::Envelope;
pub use core::error::QueueError;
pub use core::queue::{DurableQueue, EventQueue, InMemoryQueue};
