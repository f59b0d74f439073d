//! HTTP/HTTPS listeners that forward intercepted traffic to the real origin

mod forward;
mod response;
mod server;

pub use forward::{Forwarder, Scheme, Target};
pub use response::error_response;
pub use server::ProxyListener;
