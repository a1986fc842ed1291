//! Transport and wire-protocol layer: message definitions plus the
//! connection manager that turns TCP streams into one FIFO event queue.

pub mod connection;
pub mod message;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionManager, NetworkEvent};
pub use message::{AddressMessage, Bundle, NetMessage, VersionInfo, MAX_ADDRESS_SIZE};
