//! Backend adapters for the session registry.
//!
//! Provides:
//! - `SliverAdapter` - beacon-style backend through `sliver-client --json`
//! - `MetasploitAdapter` - session-style backend through `msfconsole -q -x`
//! - Client command building and bounded execution
//! - `ParsedListing` - parsed sessions plus skipped-record reporting
//! - Executable resolution and detached terminal launching

pub mod command;
pub mod listing;
pub mod metasploit;
pub mod shell;
pub mod sliver;

pub use command::{ClientOutput, CommandBuildError, CommandBuilder, CommandParts, run_client};
pub use listing::ParsedListing;
pub use metasploit::{MetasploitAdapter, MetasploitConfig};
pub use shell::{TerminalLauncher, current_shell, launch_in_terminal, resolve_executable_path, spawn_detached};
pub use sliver::{SliverAdapter, SliverConfig};
