//! Closed command set and control requests.

use crate::control::ControlError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands the acquisition loop acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    StartCollecting,
    Stop,
    Exit,
}

impl Command {
    pub fn token(self) -> &'static str {
        match self {
            Command::StartCollecting => "START_COLLECTING",
            Command::Stop => "STOP",
            Command::Exit => "EXIT",
        }
    }

    /// Parse a slot token. An empty token is the `NONE` command.
    pub fn parse(token: &str) -> Result<Option<Command>, ControlError> {
        match token.trim().to_uppercase().as_str() {
            "" | "NONE" => Ok(None),
            "START_COLLECTING" | "SPACEBAR" => Ok(Some(Command::StartCollecting)),
            "STOP" => Ok(Some(Command::Stop)),
            "EXIT" | "BYE" => Ok(Some(Command::Exit)),
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }

    /// Whether the loop must release its transport and return.
    pub fn terminates(self) -> bool {
        matches!(self, Command::Stop | Command::Exit)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A request accepted by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Command(Command),
    /// Select the label used at the next flush.
    SetLabel(String),
}

impl ControlRequest {
    /// Parse one request line: a command token or `LABEL <name>`.
    pub fn parse(text: &str) -> Result<ControlRequest, ControlError> {
        let text = text.trim();
        if let Some((head, rest)) = text.split_once(char::is_whitespace) {
            if head.eq_ignore_ascii_case("LABEL") {
                let name = rest.trim();
                if name.is_empty() {
                    return Err(ControlError::MissingLabel);
                }
                return Ok(ControlRequest::SetLabel(name.to_string()));
            }
        }
        if text.eq_ignore_ascii_case("LABEL") {
            return Err(ControlError::MissingLabel);
        }

        match Command::parse(text)? {
            Some(command) => Ok(ControlRequest::Command(command)),
            None => Err(ControlError::UnknownCommand(text.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ControlRequest::Command(command) => command.token().to_string(),
            ControlRequest::SetLabel(label) => format!("LABEL {label}"),
        }
    }
}

/// Something the loop polls for pending commands between iterations.
pub trait CommandSource {
    /// Take the next pending command, if any. Never blocks.
    fn poll(&mut self) -> Option<Command>;
}

/// Sending half of the in-process command channel.
#[derive(Debug, Clone)]
pub struct CommandSender {
    sender: Sender<Command>,
}

impl CommandSender {
    /// Returns `false` once the loop is gone.
    pub fn send(&self, command: Command) -> bool {
        self.sender.send(command).is_ok()
    }
}

/// Receiving half polled by the loop.
#[derive(Debug)]
pub struct ChannelCommands {
    receiver: Receiver<Command>,
}

impl CommandSource for ChannelCommands {
    fn poll(&mut self) -> Option<Command> {
        self.receiver.try_recv().ok()
    }
}

pub fn command_channel() -> (CommandSender, ChannelCommands) {
    let (sender, receiver) = unbounded();
    (CommandSender { sender }, ChannelCommands { receiver })
}
