//! MJPEG fan-out to HTTP viewers.
//!
//! [`BroadcastServer`] owns the listening socket and the accept task;
//! [`ClientRegistry`] owns every viewer connection that completed its
//! handshake and is the only place those sockets are written or closed.

pub mod registry;
pub mod server;

pub use registry::{ClientConnection, ClientId, ClientInfo, ClientRegistry, Delivery};
pub use server::{BroadcastError, BroadcastServer, ServerState, ServerStatus};
