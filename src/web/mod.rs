//! HTTP helpers for the listening servers
//!
//! Mime lookup plus the canned error responses the P2P and Sora control
//! listeners answer with.

pub mod util;
pub use util::{bad_request, keep_alive, mime_type, not_found, respond, server_error, SERVER_NAME};
