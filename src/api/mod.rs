//! HTTP API facade.
//!
//! A thin layer over the session coordinator: validates inputs, forwards
//! to the core, and shapes responses. No container or store logic lives
//! here.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
