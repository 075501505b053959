use std::fmt;

/// Convenience alias for fallible bus operations.
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Structural errors surfaced by public queue and subscription entry points.
///
/// Per-message listener failures are deliberately *not* represented here:
/// they are outcome values consumed by the consumer loop's retry logic and
/// never propagate to the enqueuing caller.
#[derive(Debug)]
pub enum BusError {
    /// A queue with the given name has already been created.
    QueueAlreadyExists(String),
    /// No queue with the given name is registered.
    QueueNotFound(String),
    /// A subscription datagram could not be decoded from wire bytes.
    DatagramDecode(String),
    /// The component has been torn down and no longer accepts operations.
    ResourceDisposed(&'static str),
    /// A multicast send or socket setup failure.
    Transport(String),
    /// A durable backend rejected or failed an operation.
    Store(String),
}

impl std::error::Error for BusError {}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::QueueAlreadyExists(name) => write!(f, "queue '{name}' already exists"),
            BusError::QueueNotFound(name) => write!(f, "queue '{name}' not found"),
            BusError::DatagramDecode(reason) => write!(f, "malformed datagram: {reason}"),
            BusError::ResourceDisposed(what) => write!(f, "{what} has been disposed"),
            BusError::Transport(msg) => write!(f, "transport error: {msg}"),
            BusError::Store(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::Transport(e.to_string())
    }
}
