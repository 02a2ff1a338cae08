#![forbid(unsafe_code)]

pub mod local;
mod store;

pub use store::*;
