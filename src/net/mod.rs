//! Loopback UDP plumbing between the gateway relay paths and the
//! per-mount media pipeline.

mod socket;

pub use socket::{SocketFactory, UdpEndpoint};
