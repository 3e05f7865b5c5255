//! RTSP protocol front: request parsing, response formatting, transport
//! negotiation and the SAT>IP query string.

pub mod handler;
pub mod query;
pub mod request;
pub mod response;
pub mod sdp;
pub mod transport;

pub use handler::MethodHandler;
pub use query::SatipQuery;
pub use request::{RtspMethod, RtspRequest};
pub use response::{RtspResponse, StatusCode};
pub use transport::TransportRequest;
