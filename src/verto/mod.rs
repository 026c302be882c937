//! The media-server leg: wire framing and the persistent RPC endpoint.

pub mod endpoint;
pub mod protocol;

pub use endpoint::{Credentials, IncomingRequest, TransportError, VertoEndpoint, VertoTransport};
pub use protocol::{dialog_params_for, generate_token};
