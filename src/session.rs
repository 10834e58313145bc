//! Per connection command loop.
//!
//! ```text
//!   AWAIT_COMMAND --login--> REGISTERED --> AWAIT_COMMAND
//!   AWAIT_COMMAND --chat---> IN_CHAT -----> AWAIT_COMMAND
//!   any state --end of stream / shutdown--> CLOSED
//! ```
//!
//! A session that someone else called into a chat follows it through the hub: it counts as
//! IN_CHAT while its lines are routed to the relay and leaves on its own close token.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{Frame, LineCodec};
use crate::command::{reply, Command};
use crate::error::{Error, Result};
use crate::hub::{ConnectionHandle, Engaged, Hub, OUTBOUND_CAPACITY};
use crate::relay::{LineReader, Participant, Relay};

/// What every connection task needs from the server.
#[derive(Debug, Clone)]
pub struct Shared {
    pub hub: Hub,
    pub close_token: Arc<str>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitCommand,
    Registered,
    InChat,
    Closed,
}

impl State {
    /// Where a session lands once it sees whether a chat is routing its lines.
    fn follow_engagement(self, routed: bool) -> State {
        match (self, routed) {
            (_, true) => State::InChat,
            (State::InChat, false) => State::AwaitCommand,
            (state, false) => state,
        }
    }
}

struct Session {
    addr: SocketAddr,
    handle: ConnectionHandle,
    shared: Shared,
    state: State,
}

/// Serve one accepted socket until it closes or the server shuts down.
pub async fn handle_connection(socket: TcpStream, addr: SocketAddr, shared: Shared) {
    let (read_half, write_half) = socket.into_split();
    let (outbound, lines) = mpsc::channel(OUTBOUND_CAPACITY);
    shared.tracker.spawn(write_lines(
        addr,
        FramedWrite::new(write_half, LineCodec::new()),
        lines,
        shared.shutdown.clone(),
    ));

    let handle = ConnectionHandle::new(addr, outbound);
    shared.hub.insert(handle.clone());
    info!(%addr, "connection established");

    let mut session = Session {
        addr,
        handle,
        shared,
        state: State::AwaitCommand,
    };
    session.run(FramedRead::new(read_half, LineCodec::new())).await;

    // Dropping the last handles lets the writer flush and exit. The nickname stays registered.
    session.shared.hub.remove(addr);
    info!(%addr, "connection closed");
}

/// Drain queued lines into the socket. Ends once every handle to the connection is dropped.
///
/// A peer that stops reading can park a write forever, so shutdown abandons whatever is left.
async fn write_lines(
    addr: SocketAddr,
    mut sink: FramedWrite<OwnedWriteHalf, LineCodec>,
    mut lines: Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        closed = SinkExt::<String>::close(&mut sink) => {
                            if let Err(err) = closed {
                                debug!(%addr, error = %err, "shutdown of write half failed");
                            }
                        }
                    }
                    return;
                }
            },
        };
        let sent = tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = sink.send(line) => sent,
        };
        if let Err(err) = sent {
            warn!(%addr, error = %err, "write failed");
        }
    }
    debug!(%addr, "writer stopped by shutdown");
}

impl Session {
    fn follow_engagement(&mut self, routed: bool) {
        let next = self.state.follow_engagement(routed);
        if next != self.state {
            self.transition(next);
        }
    }

    fn transition(&mut self, state: State) {
        debug!(addr = %self.addr, from = ?self.state, to = ?state, "session state");
        self.state = state;
    }

    fn reply<S: Into<String>>(&self, line: S) {
        if !self.handle.send(line) {
            debug!(addr = %self.addr, "reply dropped, writer gone");
        }
    }

    async fn run(&mut self, mut reader: LineReader) {
        let shutdown = self.shared.shutdown.clone();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(addr = %self.addr, "shutdown requested");
                    break;
                }
                next = reader.next() => next,
            };
            let line = match next {
                None => {
                    debug!(addr = %self.addr, "end of stream");
                    break;
                }
                // FramedRead is finished after an error; the next poll yields None and closes.
                Some(Err(err)) => {
                    warn!(addr = %self.addr, error = %err, "read failed");
                    continue;
                }
                Some(Ok(Frame::Malformed(raw))) => {
                    warn!(addr = %self.addr, len = raw.len(), "ignoring line that is not utf-8");
                    continue;
                }
                Some(Ok(Frame::Line(line))) => line,
            };

            // Leaving a chat someone else started. The relay still sees the token and stops,
            // but the lines after it are commands again.
            if *line == *self.shared.close_token {
                if let Some(route) = self.shared.hub.leave(self.addr) {
                    if route.send(line).is_err() {
                        debug!(addr = %self.addr, "relay already stopped");
                    }
                    self.reply(reply::CHAT_ENDED);
                    self.follow_engagement(false);
                    continue;
                }
            }

            // Someone else started a chat with us; our lines belong to it.
            let line = match self.shared.hub.route(self.addr) {
                Some(route) => match route.send(line) {
                    Ok(()) => {
                        self.follow_engagement(true);
                        continue;
                    }
                    Err(mpsc::error::SendError(line)) => line,
                },
                None => line,
            };
            self.follow_engagement(false);

            reader = match self.dispatch(Command::parse(&line), reader).await {
                Some(reader) => reader,
                None => break,
            };
        }
        self.transition(State::Closed);
    }

    async fn dispatch(&mut self, command: Command, reader: LineReader) -> Option<LineReader> {
        match command {
            Command::Login(ref name) | Command::Chat(ref name) if name.is_empty() => {
                self.reply(Error::MissingName.to_string());
                Some(reader)
            }
            Command::Login(name) => {
                self.login(&name);
                Some(reader)
            }
            Command::Chat(name) => self.chat(&name, reader).await,
            unknown @ Command::Unknown { .. } => {
                info!(addr = %self.addr, command = %unknown, "unknown command");
                Some(reader)
            }
        }
    }

    fn login(&mut self, name: &str) {
        self.shared.hub.register(name, self.addr);
        self.transition(State::Registered);
        info!(addr = %self.addr, %name, "registered");
        self.reply(reply::registered(name));
        self.transition(State::AwaitCommand);
    }

    /// Resolve both sides of a chat and claim them in the hub.
    fn prepare_chat(&self, target: &str) -> Result<(Participant, Participant, Engaged)> {
        let hub = &self.shared.hub;
        let you = hub.lookup_by_address(self.addr).ok_or(Error::NotRegistered)?;
        let peer_addr = hub.lookup_by_name(target).ok_or(Error::NoSuchAccount)?;
        hub.lookup(peer_addr).ok_or(Error::NotConnected)?;
        let engaged = hub.engage(self.addr, peer_addr)?;
        Ok((
            Participant::new(you, engaged.you.clone()),
            Participant::new(target.to_string(), engaged.peer.clone()),
            engaged,
        ))
    }

    async fn chat(&mut self, target: &str, reader: LineReader) -> Option<LineReader> {
        let (you, peer, engaged) = match self.prepare_chat(target) {
            Ok(prepared) => prepared,
            Err(err) => {
                debug!(addr = %self.addr, %target, error = %err, "chat refused");
                self.reply(err.to_string());
                return Some(reader);
            }
        };

        self.transition(State::InChat);
        let peer_handle = peer.handle.clone();
        let relay = Relay::new(you, peer, self.shared.close_token.clone());
        let reader = relay
            .run(
                reader,
                engaged.peer_lines,
                &self.shared.shutdown,
                &self.shared.tracker,
            )
            .await;
        let peer_stayed = self
            .shared
            .hub
            .release(engaged.chat, self.addr, peer_handle.addr());

        self.reply(reply::CHAT_ENDED);
        // A peer that left with its own close token has already been told.
        if peer_stayed {
            peer_handle.send(reply::CHAT_ENDED);
        }
        self.transition(State::AwaitCommand);
        reader
    }
}
