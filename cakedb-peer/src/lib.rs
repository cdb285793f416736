//! CakeDB peer endpoint.
//!
//! Serves a revision store over HTTP so other CakeDB instances can replicate
//! with it.

pub mod handlers;
pub mod server;

pub use handlers::{PeerAuth, handle_peer_request};
pub use server::PeerServer;
