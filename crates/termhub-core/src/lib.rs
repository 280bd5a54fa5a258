//! termhub-core: shared protocol library for termhub.
//!
//! Provides the terminal message protocol, the session control protocol,
//! JSON framing helpers, and the common error type.

pub mod codec;
pub mod control;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode, decode_bytes, encode, Utf8Decoder};
pub use control::{ControlRequest, ControlResponse, SessionInfo};
pub use error::{TermError, TermResult};
pub use messages::{ClientMessage, ServerMessage};
