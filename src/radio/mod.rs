pub mod controller;
pub mod transport;

pub use controller::{RadioController, RadioEvent};
pub use transport::{NullTransport, RadioTransport, TcpCatTransport};
