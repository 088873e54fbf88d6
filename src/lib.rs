pub mod config;
pub mod crypto;
pub mod pivot;
pub mod plugin;
pub mod protocol;
pub mod server;
pub mod tasks;
pub mod terminal;
pub mod tunnel;

pub use config::ServerConfig;
pub use server::Teamserver;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NocturneError {
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Authentication failure")]
    AuthenticationFailure,

    #[error("Channel {0} is closed")]
    ChannelClosed(u32),

    #[error("Unknown channel: {0}")]
    UnknownChannel(u32),

    #[error("Channel {0} already in use")]
    ChannelInUse(u32),

    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),

    #[error("Unknown terminal: {0}")]
    UnknownTerminal(u32),

    #[error("Unknown pivot: {0}")]
    UnknownPivot(String),

    #[error("Pivot conflict: {0}")]
    PivotConflict(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown listener: {0}")]
    UnknownListener(String),

    #[error("Listener already registered: {0}")]
    ListenerExists(String),

    #[error("Agent already registered: {0}")]
    AgentExists(String),

    #[error("Unknown command: {0}")]
    InvalidCommand(String),

    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Sync task timed out")]
    Timeout,

    #[error("Sync task cancelled")]
    Cancelled,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NocturneError>;
