//! Session management: registry, PTY lifecycle, output history.

pub mod env;
pub mod history;
pub mod input;
pub mod manager;
pub mod output;
pub mod pty;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{generate_session_id, Session, SessionRegistry};
pub use output::OutputEnd;
pub use pty::PtySpawner;
