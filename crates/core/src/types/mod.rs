//! Value types shared across the runner.

pub mod exec;
pub mod message;

pub use exec::*;
pub use message::*;
