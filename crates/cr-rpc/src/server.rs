//! RpcServer - minimal TCP acceptor in front of the dispatcher
//!
//! Each accepted socket gets a reader loop that decodes request frames and
//! hands them to [`RequestDispatcher::process_request`], and a writer task
//! that serializes responses back onto the same socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use cr_common::{InvocationRequest, InvocationResponse};
use cr_config::AppConfig;
use crate::context::{ProviderContext, ResponseSink};
use crate::dispatcher::RequestDispatcher;
use crate::error::RpcError;
use crate::handler::HandlerRegistry;
use crate::registry::PoolRegistry;
use crate::wire;
use crate::Result;

/// Response sink bound to one accepted socket
pub struct ServerChannel {
    remote: String,
    tx: mpsc::UnboundedSender<InvocationResponse>,
}

impl ResponseSink for ServerChannel {
    fn write_response(&self, response: InvocationResponse) -> Result<()> {
        self.tx
            .send(response)
            .map_err(|_| RpcError::ConnectionClosed(self.remote.clone()))
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }
}

pub struct RpcServer {
    listener: TcpListener,
    dispatcher: Arc<RequestDispatcher>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the configured address and build a dispatcher over `registry`
    pub async fn bind(
        config: &AppConfig,
        registry: Arc<PoolRegistry>,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Self> {
        let address = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&address).await?;
        let dispatcher = Arc::new(RequestDispatcher::new(config, registry, handlers));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(address = %listener.local_addr()?, "RPC server bound");
        Ok(Self {
            listener,
            dispatcher,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    /// Sender that stops the accept loop when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept until shutdown is signalled, then stop the dispatcher
    pub async fn run(self) {
        self.dispatcher.start();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted connection");
                        tokio::spawn(serve_connection(
                            self.dispatcher.clone(),
                            stream,
                            peer,
                            self.shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => error!(error = %e, "Accept failed"),
                },
                _ = shutdown_rx.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        self.dispatcher.stop().await;
    }
}

async fn serve_connection(
    dispatcher: Arc<RequestDispatcher>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let channel: Arc<dyn ResponseSink> = Arc::new(ServerChannel {
        remote: peer.to_string(),
        tx,
    });
    let writer = tokio::spawn(write_responses(write_half, rx, peer));

    let mut reader = BufReader::new(read_half);
    loop {
        let frame = tokio::select! {
            frame = wire::read_frame::<_, InvocationRequest>(&mut reader) => frame,
            _ = shutdown_rx.recv() => break,
        };
        match frame {
            Ok(Some(request)) => {
                // Replies are written by the task itself
                let _ = dispatcher.process_request(request, ProviderContext::new(channel.clone()));
            }
            Ok(None) => {
                debug!(peer = %peer, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to read request frame");
                break;
            }
        }
    }

    drop(channel);
    // In-flight requests hold the channel; the writer ends once they finish
    let _ = writer.await;
}

async fn write_responses(
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<InvocationResponse>,
    peer: SocketAddr,
) {
    while let Some(response) = rx.recv().await {
        if let Err(e) = wire::write_frame(&mut socket, &response).await {
            warn!(peer = %peer, seq = response.seq, error = %e, "Failed to write response");
            break;
        }
    }
}
