//! LSP client for querying language servers on behalf of agent tools.
//!
//! [`LspManager`] owns one [`LspClient`] per language and starts each server
//! on first use. Clients speak JSON-RPC 2.0 over the server's stdio.

pub mod codec;
pub mod types;

mod client;
mod config;
mod error;
mod manager;
mod process;
pub(crate) mod protocol;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{LspClient, REQUEST_TIMEOUT};
pub use error::LspError;
pub use manager::LspManager;
pub use process::{BoxedReader, BoxedWriter, Launcher, ProcessSpec, ServerIo, SubprocessLauncher};
pub use protocol::{ResponseError, file_uri_to_path, path_to_file_uri};
pub use types::{ClientState, LspConfig, ServerCapabilities, ServerConfig};
