//! Weft Transport Layer
//!
//! HTTP helpers shared by the server and its tests. Weft speaks plain
//! HTTP/1.1 through hyper; there is no custom wire framing.

pub mod http;

pub use http::{HttpTransport, HyperRequest, HyperResponse};
