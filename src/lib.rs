/// Multi-tenant HTTP gateway for scrcpy device streams
///
/// Each configured port owns a session of up to three device sockets (video,
/// audio, control). The gateway multiplexes the media streams to HTTP
/// clients and plugin processes, and drives device input through a tokenized
/// command language on the control socket.
pub mod adb;
pub mod clipboard;
pub mod command;
pub mod config;
pub mod decoder;
pub mod http;
pub mod plugin;
pub mod protocol;
pub mod pump;
pub mod session;

pub use config::Config;
pub use session::Session;

/// Result type for the application
pub type Result<T> = anyhow::Result<T>;
