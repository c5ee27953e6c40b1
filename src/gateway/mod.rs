//! HTTP surface: router, handlers and server lifecycle

pub mod cores;
mod router;
mod server;
pub mod session;

pub use router::{AppState, create_router};
pub use server::Gateway;
