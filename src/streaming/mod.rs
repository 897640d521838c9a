pub mod api;
pub mod encode;
pub mod handlers;
pub mod server;

pub use server::{ServerState, StreamServer};
