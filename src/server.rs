//! Hub server: wiring plus a TCP accept loop.
//!
//! [`HubServer`] assembles the protocol registry, method table, lifetime
//! manager and dispatcher into a [`HubConnectionHandler`], then spawns one
//! task per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::HubOptions;
use crate::connection::{ConnectionInfo, HubConnectionHandler, TransportReader, TransportWriter};
use crate::dispatcher::{HubDispatcher, HubMethods};
use crate::lifetime::{DefaultHubLifetimeManager, GroupManager, HubClients, HubLifetimeManager};
use crate::protocol::ProtocolRegistry;

/// Sends to clients from outside a hub method, e.g. a background job.
#[derive(Clone, Debug)]
pub struct HubContext {
    clients: HubClients,
    groups: GroupManager,
}

impl HubContext {
    /// Context over `lifetime`.
    pub fn new(lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        Self {
            clients: HubClients::new(Arc::clone(&lifetime)),
            groups: GroupManager::new(lifetime),
        }
    }

    /// Client addressing.
    pub fn clients(&self) -> &HubClients {
        &self.clients
    }

    /// Group membership.
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }
}

/// Builder for [`HubServer`].
#[derive(Default)]
pub struct HubServerBuilder {
    options: HubOptions,
    protocols: Option<ProtocolRegistry>,
    methods: Option<HubMethods>,
    lifetime: Option<Arc<dyn HubLifetimeManager>>,
}

impl std::fmt::Debug for HubServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubServerBuilder")
            .field("options", &self.options)
            .field("protocols", &self.protocols)
            .field("custom_lifetime", &self.lifetime.is_some())
            .finish_non_exhaustive()
    }
}

impl HubServerBuilder {
    /// Use `options` instead of the defaults.
    #[must_use]
    pub fn options(mut self, options: HubOptions) -> Self {
        self.options = options;
        self
    }

    /// Offer these protocols instead of the ones named in the options.
    #[must_use]
    pub fn protocols(mut self, protocols: ProtocolRegistry) -> Self {
        self.protocols = Some(protocols);
        self
    }

    /// Hub methods.
    #[must_use]
    pub fn methods(mut self, methods: HubMethods) -> Self {
        self.methods = Some(methods);
        self
    }

    /// Lifetime manager; defaults to a single-process one.
    #[must_use]
    pub fn lifetime(mut self, lifetime: Arc<dyn HubLifetimeManager>) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Validate the options and assemble the server.
    pub fn build(self) -> Result<HubServer> {
        self.options.validate().context("Invalid hub options")?;
        let protocols = match self.protocols {
            Some(protocols) => protocols,
            None => self.options.protocol_registry()?,
        };
        if protocols.is_empty() {
            anyhow::bail!("No hub protocols registered");
        }
        let lifetime = self
            .lifetime
            .unwrap_or_else(|| Arc::new(DefaultHubLifetimeManager::new()));
        let methods = Arc::new(self.methods.unwrap_or_else(|| HubMethods::builder().build()));

        let dispatcher = Arc::new(HubDispatcher::new(
            methods,
            Arc::clone(&lifetime),
            self.options.dispatcher_options(),
        ));
        let handler = Arc::new(HubConnectionHandler::new(
            protocols,
            dispatcher,
            Arc::clone(&lifetime),
            self.options.connection_options(),
        ));
        Ok(HubServer {
            handler,
            lifetime,
            options: self.options,
        })
    }
}

/// A configured hub, ready to accept connections.
pub struct HubServer {
    handler: Arc<HubConnectionHandler>,
    lifetime: Arc<dyn HubLifetimeManager>,
    options: HubOptions,
}

impl std::fmt::Debug for HubServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubServer")
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl HubServer {
    /// Start building a server.
    pub fn builder() -> HubServerBuilder {
        HubServerBuilder::default()
    }

    /// Options the server was built with.
    pub fn options(&self) -> &HubOptions {
        &self.options
    }

    /// The connection handler, for hosts bringing their own transport.
    pub fn handler(&self) -> &Arc<HubConnectionHandler> {
        &self.handler
    }

    /// Handle for sending to clients from outside hub methods.
    pub fn context(&self) -> HubContext {
        HubContext::new(Arc::clone(&self.lifetime))
    }

    /// Serve one connection over an arbitrary transport.
    pub async fn connect<R, W>(&self, reader: R, writer: W, info: ConnectionInfo)
    where
        R: TransportReader,
        W: TransportWriter + 'static,
    {
        self.handler.run_connection(reader, writer, info).await;
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, CancellationToken::new()).await
    }

    /// Accept connections on `listener` until `shutdown` is cancelled.
    /// Connections already running are left to finish on their own.
    pub async fn serve_until(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        log::info!("[Hub] Listening on {addr}");

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("[Hub] Could not set TCP_NODELAY for {peer}: {e}");
                    }
                    self.spawn_connection(stream, peer);
                }
                Err(e) => {
                    log::error!("[Hub] Accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }

        log::info!("[Hub] Stopped listening on {addr}");
        Ok(())
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let handler = Arc::clone(&self.handler);
        log::debug!("[Hub] Accepted {peer}");
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            handler
                .run_connection(reader, writer, ConnectionInfo::default())
                .await;
            log::debug!("[Hub] Connection from {peer} finished");
        });
    }
}
