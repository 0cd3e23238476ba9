use anyhow::Result;
use clap::Args;
use xshell::Shell;

use super::common;

#[derive(Args)]
pub struct Precommit {
    /// Also build the core crate for the bare-metal target
    #[arg(long)]
    no_std: bool,
}

impl Precommit {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        common::run_fmt_check(sh)?;
        common::run_clippy(sh)?;
        if self.no_std {
            common::run_no_std(sh)?;
        }

        eprintln!("Precommit checks passed!");
        Ok(())
    }
}
