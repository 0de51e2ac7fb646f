//! Viewer push surface: a JSON-lines protocol over TCP fed by the runtime's
//! tick broadcast.

mod protocol;
mod server;

pub use protocol::{ViewerRequest, ViewerResponse, ViewerStream, VIEWER_PROTOCOL_VERSION};
pub use server::{ViewerServer, ViewerServerConfig, ViewerServerError, DEFAULT_VIEWER_BIND_ADDR};
