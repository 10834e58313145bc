//! Command frames sent by a client outside of an active chat.
//!
//! A command line is `<command> <argument>`: the command is the first token, the argument is
//! everything after the first space, kept verbatim so names may contain spaces.

use std::fmt;

pub const LOGIN: &str = "login";
pub const CHAT: &str = "chat";

/// The line that ends a chat from either side.
pub const CLOSE_TOKEN: &str = "\\q";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bind a nickname to the sending connection.
    Login(String),
    /// Start a relay with the named account.
    Chat(String),
    Unknown { command: String, argument: String },
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        let (command, argument) = match line.split_once(' ') {
            Some((command, argument)) => (command, argument),
            None => (line, ""),
        };
        match command {
            LOGIN => Command::Login(argument.to_string()),
            CHAT => Command::Chat(argument.to_string()),
            _ => Command::Unknown {
                command: command.to_string(),
                argument: argument.to_string(),
            },
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Login(name) => write!(f, "{} {}", LOGIN, name),
            Command::Chat(name) => write!(f, "{} {}", CHAT, name),
            Command::Unknown { command, argument } if argument.is_empty() => {
                write!(f, "{}", command)
            }
            Command::Unknown { command, argument } => write!(f, "{} {}", command, argument),
        }
    }
}

/// Reply lines that are not lookup failures.
pub mod reply {
    pub fn registered(name: &str) -> String {
        format!("user {} registered", name)
    }

    pub const STARTED_PREFIX: &str = "chat started with";

    pub fn chat_started(peer: &str) -> String {
        format!("{} {}", STARTED_PREFIX, peer)
    }

    pub const INVITED_SUFFIX: &str = "started a chat with you";

    pub fn invited(by: &str) -> String {
        format!("{} {}", by, INVITED_SUFFIX)
    }

    pub const CHAT_ENDED: &str = "chat ended";

    /// A relayed line as it appears at the destination.
    pub fn relayed(from: &str, line: &str) -> String {
        format!("{}: {}", from, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_is_kept_verbatim() {
        assert_eq!(
            Command::parse("login Mary Ann\n"),
            Command::Login("Mary Ann".to_string())
        );
        assert_eq!(Command::parse("chat bob"), Command::Chat("bob".to_string()));
    }

    #[test]
    fn missing_argument_parses_as_empty() {
        assert_eq!(Command::parse("login"), Command::Login(String::new()));
        assert_eq!(Command::parse("  chat  "), Command::Chat(String::new()));
    }

    #[test]
    fn unknown_command_keeps_its_text() {
        let cmd = Command::parse("shout hello world");
        assert_eq!(
            cmd,
            Command::Unknown {
                command: "shout".to_string(),
                argument: "hello world".to_string(),
            }
        );
        assert_eq!(cmd.to_string(), "shout hello world");
    }

    #[test]
    fn commands_are_case_sensitive() {
        match Command::parse("LOGIN alice") {
            Command::Unknown { command, .. } => assert_eq!(command, "LOGIN"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn relayed_line_is_prefixed_with_sender() {
        assert_eq!(reply::relayed("alice", "hello"), "alice: hello");
        assert_eq!(reply::invited("alice"), "alice started a chat with you");
    }
}
