//! Shared integration test support.

mod server;

pub use server::TestServer;
