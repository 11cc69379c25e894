pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod filters;
pub mod pair;
pub mod proxy;
pub mod transport;
