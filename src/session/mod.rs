//! Terminal session edge: everything an SSH front end needs once it has a
//! byte stream. Auth helpers, the task menu, and the session handler.

pub mod auth;
pub mod banner;
pub mod handler;
pub mod menu;
pub mod trie;

pub use auth::{authenticate_key, authenticate_password, AuthOutcome, AuthService};
pub use handler::{run_terminal_session, SessionEnv, EXIT_CODE_ERROR, EXIT_CODE_TIMEOUT};
