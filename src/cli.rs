//! Command-line surface for the `mued` binary.
//!
//! Grounded on `wormhole`'s `clap::Parser` derive usage; `spec.md`'s own
//! scope explicitly excludes "CLI entry points" as a design concern of the
//! manager core, but a buildable binary still needs one.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "mued", about = "Multi-user endpoint manager")]
pub struct Args {
    /// Directory holding `config.toml`, `identity_mapping.json`,
    /// `user_environment.yaml`, and the persisted `endpoint.json`.
    #[arg(long, value_name = "PATH", default_value = "/etc/globus-compute/mep")]
    pub config_dir: PathBuf,

    /// Minimum `tracing` level to emit.
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Skip nothing in the manager's own process (it never daemonizes
    /// itself); kept for compatibility with the upstream `--foreground`
    /// flag used by the launching shell script. Child endpoints are always
    /// detached via `setsid()` regardless of this flag (`spec.md` §4.6).
    #[arg(long)]
    pub foreground: bool,
}
