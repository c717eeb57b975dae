mod element;
mod error;
mod local;
mod transport;

pub use element::Element;
pub use error::{Result, TransportErr};
pub use local::{LocalCluster, LocalTransport};
pub use transport::{Transport, TransportTemplate, broadcast_from_root};
