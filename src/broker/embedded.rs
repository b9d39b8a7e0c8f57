//! Embedded broker bootstrap.
//!
//! For environments without an external broker, the durable queue can run
//! against a broker hosted inside the process. The preferred way is to
//! [`EmbeddedBroker::start`] one explicitly and own its lifecycle; for the
//! common "just give me a local broker" case, [`EmbeddedBroker::shared`]
//! lazily starts a single process-wide instance. First use wins the
//! initialization race; every later caller observes the same instance.

use tokio::sync::OnceCell;
use tracing::info;

use crate::broker::server::{Broker, BrokerOptions};
use crate::core::error::QueueError;

static SHARED: OnceCell<EmbeddedBroker> = OnceCell::const_new();

/// Handle to a broker running inside this process.
pub struct EmbeddedBroker {
    broker: Broker,
}

impl EmbeddedBroker {
    /// Starts a broker with the given options and returns its handle.
    ///
    /// The broker runs until the handle is dropped or [`shutdown`] is
    /// called.
    ///
    /// [`shutdown`]: EmbeddedBroker::shutdown
    pub async fn start(opts: BrokerOptions) -> Result<EmbeddedBroker, QueueError> {
        let broker = Broker::bind(opts)
            .await
            .map_err(|e| QueueError::Connection(format!("embedded broker failed to start: {e}")))?;
        info!(addr = %broker.addr(), "embedded broker started");
        Ok(EmbeddedBroker { broker })
    }

    /// Returns the process-wide shared instance, starting it on first use.
    ///
    /// Initialization is synchronized: under concurrent first use exactly
    /// one broker is started and the options of the winning caller apply.
    /// The shared instance lives for the rest of the process.
    pub async fn shared(opts: BrokerOptions) -> Result<&'static EmbeddedBroker, QueueError> {
        SHARED
            .get_or_try_init(|| EmbeddedBroker::start(opts))
            .await
    }

    /// The broker's listen address.
    pub fn addr(&self) -> std::net::SocketAddr {
        self.broker.addr()
    }

    /// Stops the broker's tasks and releases its listen port.
    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
