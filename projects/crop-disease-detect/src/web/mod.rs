pub mod api;
pub mod push;
pub mod server;
pub mod state;
