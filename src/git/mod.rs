//! Git wire commands, pkt-line framing, hook plumbing and subprocesses.
//!
//! All repository work shells out to the `git` binary through
//! [`process::GitRunner`]; nothing here reads object or pack data itself.

pub mod command;
pub mod hooks;
pub mod pktline;
pub mod process;

pub use command::{clean_command, parse_ssh_command, GitService, RepoRef};
pub use hooks::{install_shims, HookContext, HookEnv};
pub use process::GitRunner;
