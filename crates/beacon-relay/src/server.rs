//! Relay server implementation.
//!
//! The server listens on TCP port 10010 for client connections. It owns the
//! registry, retry manager and dispatcher for its lifetime and passes them
//! explicitly to every connection task.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RelayConfig;
use crate::connection::ConnectionActor;
use crate::dispatcher::Dispatcher;
use crate::message::{JsonSerializer, MessageSerializer};
use crate::registry::ConnectionRegistry;
use crate::retry::{DeliveryObserver, LoggingDeliveryObserver, RetryManager, Transmit};
use crate::RelayError;

/// Relay server instance.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ConnectionRegistry>,
    retry: Arc<RetryManager>,
    dispatcher: Arc<Dispatcher>,
}

impl RelayServer {
    /// Create a server with JSON payloads and logged delivery failures.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        Self::with_collaborators(
            config,
            Arc::new(JsonSerializer),
            Arc::new(LoggingDeliveryObserver),
        )
    }

    /// Create a server with a custom serializer and delivery-failure observer.
    pub fn with_collaborators(
        config: RelayConfig,
        serializer: Arc<dyn MessageSerializer>,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let retry = Arc::new(RetryManager::with_observer(
            config.retry,
            Arc::clone(&registry),
            observer,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&retry),
            serializer,
            config.max_frame_length,
        ));

        Ok(Self {
            config,
            registry,
            retry,
            dispatcher,
        })
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// The retry sweep runs for as long as this call does. On shutdown every
    /// connection is closed and pending deliveries are dropped.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Relay server listening");

        let sweeper = self
            .retry
            .start_sweeper(Arc::clone(&self.dispatcher) as Arc<dyn Transmit>);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            let dispatcher = Arc::clone(&self.dispatcher);
            let config = self.config.clone();
            let token = shutdown.child_token();

            tokio::spawn(
                async move {
                    if let Err(e) = ConnectionActor::handle_connection(
                        stream, peer_addr, dispatcher, config, token,
                    )
                    .await
                    {
                        debug!(error = %e, "Connection error");
                    }
                }
                .instrument(info_span!(
                    "beacon.connection.lifecycle",
                    client_ip = %peer_addr,
                    transport = "tcp",
                )),
            );
        }

        info!("Relay server shutting down");
        if let Err(e) = sweeper.join().await {
            warn!(error = %e, "Retry sweeper task failed");
        }
        let closed = self.registry.close_all();
        let dropped = self.retry.clear();
        info!(closed, dropped, "Relay server stopped");
        Ok(())
    }

    /// Get the server configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the retry manager.
    pub fn retry_manager(&self) -> &Arc<RetryManager> {
        &self.retry
    }

    /// Get the dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The configured listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen_addr
    }
}
