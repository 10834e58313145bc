//! Terminal client.
//!
//! Reads lines from a terminal, checks commands before they go out, and prints everything the
//! server sends. While a chat is running, typed lines are sent as they are.

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Frame, LineCodec};
use crate::command::{reply, Command, CHAT, CLOSE_TOKEN, LOGIN};

pub const DEFAULT_SERVER: &str = "127.0.0.1:7777";

/// What to do with one line typed at the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Send this line to the server.
    Send(String),
    /// Print this locally, send nothing.
    Local(String),
}

/// Tracks whether typed lines are commands or chat text.
#[derive(Debug, Default)]
pub struct Terminal {
    in_chat: bool,
}

impl Terminal {
    pub fn new() -> Terminal {
        Terminal::default()
    }

    pub fn in_chat(&self) -> bool {
        self.in_chat
    }

    pub fn interpret(&mut self, line: &str) -> Input {
        if self.in_chat {
            if line == CLOSE_TOKEN {
                self.in_chat = false;
            }
            return Input::Send(line.to_string());
        }
        match Command::parse(line) {
            Command::Login(ref name) if name.is_empty() => {
                Input::Local("enter your name: login <name>".to_string())
            }
            Command::Chat(ref name) if name.is_empty() => {
                Input::Local("enter who to chat with: chat <name>".to_string())
            }
            cmd @ Command::Login(_) | cmd @ Command::Chat(_) => Input::Send(cmd.to_string()),
            Command::Unknown { command, .. } => Input::Local(format!(
                "unknown command {:?}: use {} <name> or {} <name>",
                command, LOGIN, CHAT
            )),
        }
    }

    /// Follow server notices that start or end a chat.
    pub fn observe(&mut self, line: &str) {
        if self.in_chat {
            if line == reply::CHAT_ENDED {
                self.in_chat = false;
            }
        } else if line.starts_with(reply::STARTED_PREFIX) || line.ends_with(reply::INVITED_SUFFIX) {
            self.in_chat = true;
        }
    }
}

pub struct Client {
    reader: FramedRead<OwnedReadHalf, LineCodec>,
    writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    terminal: Terminal,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Client> {
        let (read_half, write_half) = TcpStream::connect(addr).await?.into_split();
        Ok(Client {
            reader: FramedRead::new(read_half, LineCodec::new()),
            writer: FramedWrite::new(write_half, LineCodec::new()),
            terminal: Terminal::new(),
        })
    }

    /// Shuttle lines between the terminal and the server until either side closes or `shutdown`
    /// fires.
    pub async fn run<I, O>(mut self, input: I, output: O, shutdown: CancellationToken) -> io::Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let mut input = FramedRead::new(input, LineCodec::new());
        let mut output = FramedWrite::new(output, LineCodec::new());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                typed = input.next() => match typed {
                    None => break,
                    Some(Err(err)) => warn!(error = %err, "terminal read failed"),
                    Some(Ok(Frame::Malformed(_))) => {
                        output.send("input is not valid utf-8").await?;
                    }
                    Some(Ok(Frame::Line(line))) => match self.terminal.interpret(&line) {
                        Input::Send(line) => self.writer.send(line).await?,
                        Input::Local(note) => output.send(note).await?,
                    },
                },
                received = self.reader.next() => match received {
                    None => {
                        debug!("server closed the connection");
                        break;
                    }
                    Some(Err(err)) => warn!(error = %err, "server read failed"),
                    Some(Ok(Frame::Malformed(raw))) => {
                        warn!(len = raw.len(), "server sent a line that is not utf-8");
                    }
                    Some(Ok(Frame::Line(line))) => {
                        self.terminal.observe(&line);
                        output.send(line).await?;
                    }
                },
            }
        }
        SinkExt::<String>::close(&mut output).await?;
        Ok(())
    }
}
