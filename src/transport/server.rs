//! TCP connection multiplexer.
//!
//! One accept loop, one task per connection. Each task owns its [`Session`]
//! outright, so no two requests of one connection ever run concurrently.
//! The only shared state is the store behind the dispatcher.
//!
//! The loop ends when a stop request arrives on the shutdown channel, or when
//! a connection reports a fatal storage error. Either way every connection
//! task is aborted and its socket closed before the loop returns.

use crate::config::ServerConfig;
use crate::core::codec::{Inbound, RequestCodec};
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::Response;
use crate::protocol::session::Session;
use crate::storage::Store;
use crate::utils::metrics::ServerMetrics;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(store, Arc::clone(&metrics)));
        Self {
            config,
            dispatcher,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        info!(address = %addr, "Listening");
        Ok(listener)
    }

    /// Serve until Ctrl-C.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(forward_stop_signal(tokio::signal::ctrl_c(), shutdown_tx));

        self.run_with_shutdown(listener, shutdown_rx).await
    }

    /// Serve until a stop request arrives or the sender is dropped.
    ///
    /// # Errors
    /// The first fatal error reported by any connection.
    #[instrument(skip_all, fields(max_connections = self.config.max_connections))]
    pub async fn run_with_shutdown(
        self,
        listener: TcpListener,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ProtocolError>(1);
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        let mut connections = JoinSet::new();

        let period = if self.config.metrics_interval.is_zero() {
            Duration::from_secs(3600)
        } else {
            self.config.metrics_interval
        };
        let mut metrics_tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Stop requested, closing connections");
                    break Ok(());
                }

                Some(err) = fatal_rx.recv() => {
                    error!(error = %err, "Fatal storage error, aborting server loop");
                    break Err(err);
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }

                _ = metrics_tick.tick() => {
                    if !self.config.metrics_interval.is_zero() {
                        self.metrics.log_metrics();
                    }
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let metrics = Arc::clone(&self.metrics);
                            let permits = Arc::clone(&permits);
                            let fatal_tx = fatal_tx.clone();
                            let codec = RequestCodec::new(self.config.max_payload_size);
                            let buffer = self.config.read_buffer_size;

                            connections.spawn(async move {
                                // Clients beyond the limit stay connected but wait here.
                                let Ok(_permit) = permits.acquire_owned().await else {
                                    return;
                                };
                                info!(peer = %peer, "New connection established");
                                metrics.connection_opened();

                                let result =
                                    serve_connection(stream, peer, codec, buffer, &dispatcher).await;

                                metrics.connection_closed();
                                match result {
                                    Ok(()) => info!(peer = %peer, "Connection closed"),
                                    Err(e) if e.is_fatal() => {
                                        let _ = fatal_tx.send(e).await;
                                    }
                                    Err(e) => debug!(peer = %peer, error = %e, "Connection ended with error"),
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        };

        connections.abort_all();
        while connections.join_next().await.is_some() {}
        self.metrics.log_metrics();
        result
    }
}

/// Turn a completed stop signal into a stop request.
///
/// If the signal cannot be watched the sender is held forever, since
/// dropping it would stop the server.
async fn forward_stop_signal<F>(signal: F, shutdown_tx: mpsc::Sender<()>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal, stopping server");
            let _ = shutdown_tx.send(()).await;
        }
        Err(e) => {
            error!(error = %e, "Cannot listen for shutdown signal, running until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Drive one connection until the peer leaves, the session closes, or a
/// stream error occurs.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    codec: RequestCodec,
    buffer: usize,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let mut framed = Framed::with_capacity(stream, codec, buffer);
    let mut session = Session::new();

    while let Some(frame) = framed.next().await {
        let outcome = match frame {
            Ok(Inbound::Request(request)) => dispatcher.handle(&mut session, request).await?,
            Ok(Inbound::Rejected { code, error }) => dispatcher.reject_frame(code, &error),
            Err(ProtocolError::OversizedPacket(len)) => {
                warn!(peer = %peer, declared = len, "Oversized frame, closing connection");
                dispatcher.metrics().codec_error();
                let _ = framed.send(Response::GeneralError).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(response) = outcome.response {
            debug!(peer = %peer, code = ?response.code(), "Sending response");
            framed.send(response).await?;
        }
        if outcome.close {
            debug!(peer = %peer, "Session finished");
            break;
        }
    }
    Ok(())
}
