use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// One of the two required sockets could not be set up
    #[error("failed to bind {socket} udp socket: {source}")]
    Bind {
        socket: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Multicast interface selection failed
    #[error("failed to set multicast interface: {0}")]
    Interface(#[source] std::io::Error),

    /// Query message could not be encoded
    #[error("failed to encode query: {0}")]
    Encode(#[from] hickory_proto::error::ProtoError),

    /// Query datagram could not be transmitted
    #[error("failed to send query: {0}")]
    Send(#[source] std::io::Error),

    /// The client has been closed
    #[error("mdns client is closed")]
    Closed,
}
