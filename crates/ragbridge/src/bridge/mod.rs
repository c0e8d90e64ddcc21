//! Wire layer between the bridge and its worker.
//!
//! - **protocol**: message shapes (outbound requests, inbound responses, stream chunks)
//! - **codec**: newline-delimited JSON framing for the worker's stdin/stdout

pub mod codec;
pub mod protocol;
