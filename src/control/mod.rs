//! Out-of-band control of the acquisition loop.
//!
//! Commands reach the loop only through [`CommandSource`]s that it polls at
//! the start of each iteration. Handlers never run pipeline work themselves.
//!
//! - [`command`]: the closed command set and the in-process channel
//! - [`socket`]: loopback UDP control server with acknowledgements
//! - [`slot`]: read-then-clear command file and label sources
//! - [`liveness`]: process liveness token

pub mod command;
pub mod liveness;
pub mod slot;
pub mod socket;

pub use command::{command_channel, ChannelCommands, Command, CommandSender, CommandSource, ControlRequest};
pub use liveness::{LivenessGuard, LivenessToken};
pub use slot::{FileCommandSlot, FileLabelSlot, FixedLabel, LabelChain, LabelSource, SharedLabel};
pub use socket::{send_request, ControlServer};

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("no label selected")]
    MissingLabel,

    #[error("no reply from control server at {0}")]
    NoReply(SocketAddr),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("invalid liveness token: {0}")]
    Token(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
