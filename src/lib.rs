pub mod common;
pub mod config;
pub mod error;
pub mod logging;
pub mod offline;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;
