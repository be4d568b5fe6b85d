#![deny(unused)]
//! Core types, configuration, and error definitions for the agent runner.
//!
//! This crate provides the value objects that flow between the sandbox,
//! transport, and resilience layers: [`ExecSpec`]/[`ExecResult`] for one
//! sandboxed command, the [`Message`] model for parsed agent output, and the
//! shared [`Error`] type.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, ErrorLayer, Result};
pub use types::*;
