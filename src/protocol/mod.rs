use thiserror::Error;

pub mod control;
pub mod keycode;
pub mod media;

pub use control::{ControlMessage, DeviceEvent};
pub use media::MediaPacket;

/// Wire-level errors on the device-facing sockets
#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, WireError>;
