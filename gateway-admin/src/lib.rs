//! Gateway Admin - standalone HTTP control endpoint for remote gateways.
//!
//! A gateway is a named remote endpoint (host and port) with an optional bag of
//! queue attributes. The endpoint parses `/add` and `/remove` requests and hands
//! the result to a [`GatewayChangeListener`]; [`GatewayRegistry`] is the
//! in-memory listener used by the binary.
//!
//! ```text
//! GET /add?id=US&endpointId=US-1&host=localhost&port=44444   -> 200 "Added gateway:US"
//! GET /remove?id=US                                          -> 200 "Removed gateway:US"
//! GET /remove?id=US                                          -> 200 "Gateway US not removed"
//! GET /anything-else                                         -> 404 usage hint
//! ```

mod types;
pub mod api;
pub mod registry;

pub use registry::{GatewayChangeListener, GatewayRegistry};
pub use types::{Gateway, GatewayError, GatewayQueueAttributes};
