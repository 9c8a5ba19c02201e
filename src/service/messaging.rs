//! The node's messaging service.
//!
//! Owns the listener, the shared registries and the outbound connection pool.
//! Every accepted socket gets its own task running an
//! [`IncomingConnection`]; a second task sweeps abandoned callbacks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MessagingConfig;
use crate::core::packet::{Packet, PacketType};
use crate::core::registry::PacketRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::{Dispatcher, InboundMessage, ResponseHandle};
use crate::protocol::handshake::Preamble;
use crate::protocol::membership::Membership;
use crate::protocol::versions::VersionTable;
use crate::transport::incoming::{ConnectionContext, IncomingConnection};
use crate::transport::outbound::{OutboundConnection, OutboundOptions};
use crate::utils::metrics::Metrics;

/// One slot per peer, empty until connected and again after a send fails.
type Slot = Arc<Mutex<Option<OutboundConnection>>>;

pub struct MessagingService {
    config: MessagingConfig,
    local: SocketAddr,
    ctx: ConnectionContext,
    pool: std::sync::Mutex<HashMap<SocketAddr, Slot>>,
    shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MessagingService {
    /// Bind the listener and start accepting connections.
    #[instrument(skip_all, fields(listen = %config.listen_address))]
    pub async fn bind(
        config: MessagingConfig,
        membership: Arc<dyn Membership>,
    ) -> Result<Arc<Self>> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }

        let listener = TcpListener::bind(&config.listen_address).await?;
        let local = listener.local_addr()?;

        let dispatcher = Dispatcher::new()
            .with_request_timeout(config.cross_node_timeout.then_some(config.request_timeout));
        let ctx = ConnectionContext {
            versions: Arc::new(VersionTable::new()),
            dispatcher: Arc::new(dispatcher),
            membership,
            registry: Arc::new(PacketRegistry::with_defaults()),
            metrics: Arc::new(Metrics::new()),
            cross_node_timeout: config.cross_node_timeout,
            max_frame_size: config.max_frame_size,
        };
        let shutdown = CancellationToken::new();

        let accept = tokio::spawn(accept_loop(
            listener,
            ctx.clone(),
            config.connect_timeout,
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(expiry_loop(
            Arc::clone(&ctx.dispatcher),
            config.callback_expiry_interval,
            shutdown.clone(),
        ));

        info!(%local, compression = ?config.internode_compression, "Messaging service listening");
        Ok(Arc::new(Self {
            config,
            local,
            ctx,
            pool: std::sync::Mutex::new(HashMap::new()),
            shutdown,
            tasks: std::sync::Mutex::new(vec![accept, sweeper]),
        }))
    }

    /// Our endpoint identity, the address peers reply to.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn versions(&self) -> &Arc<VersionTable> {
        &self.ctx.versions
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.ctx.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    pub fn register_handler<F>(&self, packet_type: PacketType, handler: F) -> Result<()>
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.ctx.dispatcher.register_handler(packet_type, handler)
    }

    /// Send a request and return the handle its ack will arrive on.
    pub async fn send_request(
        &self,
        packet: impl Into<Packet>,
        to: SocketAddr,
    ) -> Result<ResponseHandle> {
        let packet = packet.into();
        let handle = self
            .ctx
            .dispatcher
            .register_callback(to, self.config.request_timeout);
        // on failure the handle is dropped, which removes the callback
        self.send(&packet, handle.id(), to).await?;
        Ok(handle)
    }

    /// Answer request `id` from `to`.
    pub async fn send_reply(&self, packet: impl Into<Packet>, id: i32, to: SocketAddr) -> Result<()> {
        self.send(&packet.into(), id, to).await
    }

    async fn send(&self, packet: &Packet, id: i32, to: SocketAddr) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        // only sends to `to` wait on this slot, including while it connects
        let slot = self.slot(to);
        let mut slot = slot.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if slot.is_none() {
            *slot = Some(self.connect(to).await?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(ProtocolError::ConnectionClosed);
        };
        if let Err(e) = connection.send(packet, id).await {
            debug!(peer = %to, id, error = %e, "Send failed, dropping connection");
            connection.close().await;
            *slot = None;
            return Err(e);
        }
        Ok(())
    }

    fn slot(&self, to: SocketAddr) -> Slot {
        let mut pool = match self.pool.lock() {
            Ok(pool) => pool,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(pool.entry(to).or_insert_with(|| Arc::new(Mutex::new(None))))
    }

    async fn connect(&self, to: SocketAddr) -> Result<OutboundConnection> {
        let options = OutboundOptions {
            local: self.local,
            compress: self.config.compress_outbound(),
            connect_timeout: self.config.connect_timeout,
            max_frame_size: self.config.max_frame_size,
        };
        OutboundConnection::connect(
            to,
            &self.ctx.versions,
            &options,
            Arc::clone(&self.ctx.metrics),
        )
        .await
    }

    /// Stop accepting, cancel every connection loop and close the pool.
    pub async fn shutdown(&self) {
        info!(local = %self.local, "Shutting down messaging service");
        self.shutdown.cancel();

        let slots: Vec<(SocketAddr, Slot)> = match self.pool.lock() {
            Ok(mut pool) => pool.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        for (peer, slot) in slots {
            // a slot still connecting gives up within connect_timeout
            match tokio::time::timeout(self.config.shutdown_timeout, slot.lock()).await {
                Ok(mut slot) => {
                    if let Some(mut connection) = slot.take() {
                        connection.close().await;
                    }
                }
                Err(_) => warn!(%peer, "Outbound connection busy at shutdown, abandoning it"),
            }
        }
        self.ctx.dispatcher.clear_callbacks();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            if tokio::time::timeout(self.config.shutdown_timeout, task)
                .await
                .is_err()
            {
                warn!("Shutdown timeout reached, abandoning task");
            }
        }
        self.ctx.metrics.log_metrics();
    }
}

impl Drop for MessagingService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let ctx = ctx.clone();
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%remote, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let mut stream = stream;
                        let preamble = match tokio::time::timeout(
                            handshake_timeout,
                            Preamble::read(&mut stream),
                        )
                        .await
                        {
                            Ok(Ok(preamble)) => preamble,
                            Ok(Err(e)) => {
                                if e.is_framing() {
                                    ctx.metrics.framing_error();
                                }
                                debug!(%remote, error = %e, "Rejected connection preamble");
                                return;
                            }
                            Err(_) => {
                                debug!(%remote, "Timed out waiting for connection preamble");
                                return;
                            }
                        };
                        IncomingConnection::new(stream, preamble.version, preamble.compressed, ctx)
                            .run(cancel)
                            .await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            }
        }
    }
}

async fn expiry_loop(dispatcher: Arc<Dispatcher>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let expired = dispatcher.expire_callbacks(Instant::now());
                if expired > 0 {
                    debug!(expired, "Expired abandoned callbacks");
                }
            }
        }
    }
}
