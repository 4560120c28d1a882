use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    /// Malformed or unsupported capture file
    #[error("Capture file error: {0}")]
    Capture(String),

    /// Packet input that cannot be turned into a frame
    #[error("Invalid packet: {0}")]
    Packet(String),

    /// Capture filter that cannot be compiled or parsed
    #[error("Invalid capture filter: {0}")]
    Filter(String),

    #[error("Could not spawn {0} thread: {1}")]
    Spawn(&'static str, std::io::Error),
}

impl Error {
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Error::Capture(msg.into())
    }

    pub fn filter<S: Into<String>>(msg: S) -> Self {
        Error::Filter(msg.into())
    }

    pub fn packet<S: Into<String>>(msg: S) -> Self {
        Error::Packet(msg.into())
    }
}
