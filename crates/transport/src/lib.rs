#![deny(unused)]
//! Agent CLI transport.
//!
//! Turns a prompt plus [`CliOptions`] into a concrete command line, runs it
//! through a [`Sandbox`](agent_runner_sandbox::Sandbox) and parses the output
//! (`json`, `stream-json` or `text`) into typed
//! [`Message`](agent_runner_core::Message)s.
//!
//! # Usage
//!
//! ```ignore
//! let transport = CliTransport::new(sandbox, TransportConfig::default());
//! let options = CliOptions::new().with_output_format(OutputFormat::StreamJson);
//!
//! let mut stream = transport.execute_streaming_query("Explain main.rs", &options).await?;
//! while let Some(message) = stream.next().await {
//!     println!("{:?}", message?);
//! }
//! ```

pub mod command;
pub mod options;
pub mod parser;
pub mod transport;

pub use command::{build_args, build_command};
pub use options::{CliOptions, OutputFormat, PermissionMode, DEFAULT_QUERY_TIMEOUT};
pub use parser::{MessageParser, Messages, ParserState, ResultParser, StreamingParser};
pub use transport::{CliTransport, MessageStream, TransportConfig, ENTRYPOINT_ENV};
