#![deny(unused_must_use)]
#![deny(unsafe_code)]

pub mod apis;
mod candle;
mod config;
mod exchange;
mod fetcher;
mod horizon;
mod manager;
mod resolution;
pub mod store;
pub mod time;
mod tracker;

pub use candle::*;
pub use config::*;
pub use exchange::*;
pub use fetcher::*;
pub use manager::*;
pub use resolution::*;
pub use tracker::*;
