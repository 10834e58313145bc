//! Listening socket, accept loop and coordinated shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::command::CLOSE_TOKEN;
use crate::hub::Hub;
use crate::session::{handle_connection, Shared};

pub const DEFAULT_ADDR: &str = "0.0.0.0:7777";

/// How many accepted sockets may wait for a handler before accepting pauses.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The hostname:port to listen on.
    pub addr: String,
    /// Line that ends a chat.
    pub close_token: String,
    pub handoff_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addr: DEFAULT_ADDR.to_string(),
            close_token: CLOSE_TOKEN.to_string(),
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
        }
    }
}

type Accepted = (TcpStream, SocketAddr);

pub struct Server {
    listener: Arc<TcpListener>,
    config: Config,
    hub: Hub,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    pub async fn bind(config: Config) -> io::Result<Server> {
        let listener = TcpListener::bind(&config.addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        Ok(Server {
            listener: Arc::new(listener),
            config,
            hub: Hub::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Cancelling this token stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn hub(&self) -> Hub {
        self.hub.clone()
    }

    /// Accept and serve connections until the shutdown token fires, then wait for every
    /// connection task to finish before closing the listener.
    pub async fn run(self) -> io::Result<()> {
        let Server {
            listener,
            config,
            hub,
            shutdown,
            tracker,
        } = self;
        let shared = Shared {
            hub,
            close_token: Arc::from(config.close_token.as_str()),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };

        let (conn_tx, mut conn_rx) = mpsc::channel(config.handoff_capacity.max(1));
        let acceptor = tokio::spawn(accept_loop(
            listener.clone(),
            conn_tx,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = conn_rx.recv() => match accepted {
                    Some((socket, addr)) => {
                        tracker.spawn(handle_connection(socket, addr, shared.clone()));
                    }
                    None => break,
                },
            }
        }

        info!("shutting down, waiting for connections to finish");
        drain(&mut conn_rx);
        if let Err(err) = acceptor.await {
            warn!(error = %err, "accept task failed");
        }
        tracker.close();
        tracker.wait().await;

        drop(shared);
        drop(listener);
        info!("stopped");
        Ok(())
    }
}

async fn accept_loop(listener: Arc<TcpListener>, conns: Sender<Accepted>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, addr)) => {
                debug!(%addr, "accepted");
                let handoff = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = conns.send((socket, addr)) => sent,
                };
                if handoff.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "failed to accept connection"),
        }
    }
    debug!("accept loop stopped");
}

/// Close sockets that were accepted but never reached a handler.
fn drain(conns: &mut Receiver<Accepted>) {
    conns.close();
    while let Ok((_socket, addr)) = conns.try_recv() {
        debug!(%addr, "dropping connection accepted during shutdown");
    }
}
