use anyhow::Result;
use clap::Subcommand;
use xshell::Shell;

pub mod ci;
pub mod common;
pub mod fmt;
pub mod hooks;
pub mod precommit;
pub mod test;

#[derive(Subcommand)]
pub enum Command {
    /// Run CI checks (fmt, clippy, udeps, no_std, test). Runs all if no subcommand specified.
    Ci(ci::Ci),
    /// Apply rustfmt to all files
    Fmt(fmt::Fmt),
    /// Manage git hooks
    Hooks(hooks::Hooks),
    /// Run precommit checks (checks rustfmt and runs clippy)
    Precommit(precommit::Precommit),
    /// Run tests under both cornering models
    Test(test::Test),
}

impl Command {
    pub fn run(self, sh: &Shell) -> Result<()> {
        match self {
            Command::Ci(cmd) => cmd.run(sh),
            Command::Fmt(cmd) => cmd.run(sh),
            Command::Hooks(cmd) => cmd.run(sh),
            Command::Precommit(cmd) => cmd.run(sh),
            Command::Test(cmd) => cmd.run(sh),
        }
    }
}
