pub mod client;
pub mod embedded;
pub mod protocol;
pub mod server;

pub use client::{Consumer, Producer};
pub use embedded::EmbeddedBroker;
pub use server::{Broker, BrokerOptions};
