//! Bidirectional line relay between two connected accounts.
//!
//! A relay runs two forwarders, one per direction, as separate tasks:
//!
//! ```text
//!  initiator socket --FramedRead--> [you -> peer] --"you: line"--> target writer
//!  target dispatcher ---route-----> [peer -> you] --"peer: line"--> initiator writer
//! ```
//!
//! The initiator's reader is moved into its forwarder and handed back when the relay ends. The
//! target keeps reading its own socket and routes lines in through the hub.
//!
//! Every forwarder exit, whether from the close token, end of stream, a read error or shutdown,
//! cancels the relay token so the other direction stops at once instead of waiting on its next
//! read. The relay is over only when both forwarders have returned.

use std::io;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{Frame, LineCodec};
use crate::command::reply;
use crate::hub::ConnectionHandle;

/// The read side of a client connection.
pub type LineReader = FramedRead<OwnedReadHalf, LineCodec>;

/// One side of a chat.
#[derive(Debug, Clone)]
pub struct Participant {
    pub name: String,
    pub handle: ConnectionHandle,
}

impl Participant {
    pub fn new(name: String, handle: ConnectionHandle) -> Participant {
        Participant { name, handle }
    }
}

/// Why a forwarder stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    CloseToken,
    EndOfStream,
    ReadError,
    DestinationClosed,
    Cancelled,
}

pub struct Relay {
    you: Participant,
    peer: Participant,
    close_token: Arc<str>,
}

impl Relay {
    pub fn new(you: Participant, peer: Participant, close_token: Arc<str>) -> Relay {
        Relay {
            you,
            peer,
            close_token,
        }
    }

    /// Relay lines both ways until either side leaves or `shutdown` fires.
    ///
    /// Hands `reader` back once both directions have stopped. `None` means the forwarder task
    /// holding it died, and the connection can't be read any more.
    pub async fn run(
        self,
        reader: LineReader,
        peer_lines: UnboundedReceiver<String>,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Option<LineReader> {
        let Relay {
            you,
            peer,
            close_token,
        } = self;
        let token = shutdown.child_token();
        info!(you = %you.name, peer = %peer.name, "chat started");

        you.handle.send(reply::chat_started(&peer.name));
        peer.handle.send(reply::invited(&you.name));

        let outgoing = tracker.spawn(forward(
            reader,
            you.name.clone(),
            peer.handle.clone(),
            close_token.clone(),
            token.clone(),
        ));
        let incoming = tracker.spawn(forward(
            routed(peer_lines),
            peer.name.clone(),
            you.handle.clone(),
            close_token,
            token,
        ));

        // Both must finish before the relay counts as over.
        let (outgoing, incoming) = futures::join!(outgoing, incoming);
        if let Err(err) = incoming {
            warn!(peer = %peer.name, error = %err, "forwarder task failed");
        }
        match outgoing {
            Ok((reader, exit)) => {
                info!(you = %you.name, peer = %peer.name, ?exit, "chat ended");
                Some(reader)
            }
            Err(err) => {
                warn!(you = %you.name, error = %err, "forwarder task failed");
                None
            }
        }
    }
}

/// Lines routed from the target's dispatcher, shaped like a socket read.
fn routed(
    mut lines: UnboundedReceiver<String>,
) -> impl Stream<Item = io::Result<Frame>> + Unpin + Send + 'static {
    stream::poll_fn(move |cx| {
        lines
            .poll_recv(cx)
            .map(|line| line.map(|line| Ok(Frame::Line(line))))
    })
}

/// Copy lines from `source` to `to`, prefixed with `from`, until something ends the relay.
///
/// Returns the source so a borrowed socket reader can go back to its dispatcher.
pub async fn forward<S>(
    mut source: S,
    from: String,
    to: ConnectionHandle,
    close_token: Arc<str>,
    token: CancellationToken,
) -> (S, Exit)
where
    S: Stream<Item = io::Result<Frame>> + Unpin,
{
    let _stop_pair = token.clone().drop_guard();
    let exit = loop {
        let next = tokio::select! {
            _ = token.cancelled() => break Exit::Cancelled,
            next = source.next() => next,
        };
        match next {
            None => break Exit::EndOfStream,
            Some(Err(err)) => {
                warn!(from = %from, error = %err, "relay read failed");
                break Exit::ReadError;
            }
            Some(Ok(Frame::Malformed(raw))) => {
                warn!(from = %from, len = raw.len(), "dropping line that is not utf-8");
            }
            Some(Ok(Frame::Line(line))) => {
                if *line == *close_token {
                    break Exit::CloseToken;
                }
                if !to.send(reply::relayed(&from, &line)) {
                    break Exit::DestinationClosed;
                }
            }
        }
    };
    debug!(from = %from, to = %to.addr(), ?exit, "forwarder stopped");
    (source, exit)
}
