pub mod api;
pub mod client;
pub mod config;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod index;
pub mod models;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod session;
pub mod storage;
pub mod store;
pub mod uploads;
