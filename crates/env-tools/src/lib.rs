//! Tool location, bootstrapping, and interpreter discovery for envctl.
//!
//! This crate owns everything that touches external executables:
//!
//! - Locating `uv`, conda (`conda`/`mamba`/`micromamba`) and `poetry` on `PATH`
//! - Optionally bootstrapping missing tools from a conda channel via rattler
//! - Running tool subprocesses with captured output and cancellation
//! - Discovering installed Python interpreters
//!
//! # Running a tool
//!
//! ```ignore
//! use env_tools::{ToolCommand, ToolLocator, Tool};
//! use tokio_util::sync::CancellationToken;
//!
//! let locator = ToolLocator::new();
//! if let Ok(uv) = locator.locate(Tool::Uv).await {
//!     let output = ToolCommand::new(uv)
//!         .arg("--version")
//!         .run(&CancellationToken::new())
//!         .await?;
//!     println!("{}", output.combined());
//! }
//! ```

pub mod bootstrap;
pub mod interpreters;
pub mod process;
pub mod tools;

// Re-export commonly used items
pub use bootstrap::{BootstrapRequest, Bootstrapper};
pub use interpreters::{
    discover_interpreters, parse_python_version, probe_version, version_key, version_matches,
    PythonInstallation,
};
pub use process::{ToolCommand, ToolOutput};
pub use tools::{find_on_path, Tool, ToolLocator, ToolUnavailable};
