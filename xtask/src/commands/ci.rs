use anyhow::Result;
use clap::{Args, Subcommand};
use xshell::{Shell, cmd};

use super::common;

#[derive(Args)]
pub struct Ci {
    #[command(subcommand)]
    command: Option<CiCommand>,
}

#[derive(Subcommand)]
pub enum CiCommand {
    /// Run cargo fmt check
    Fmt,
    /// Run cargo clippy
    Clippy,
    /// Run cargo udeps to check for unused dependencies
    Udeps,
    /// Build the core crate for a bare-metal target
    NoStd,
    /// Run cargo test
    Test(TestArgs),
}

#[derive(Args, Default)]
pub struct TestArgs {
    /// Additional arguments to pass to cargo test
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Ci {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        match &self.command {
            Some(cmd) => cmd.run(sh),
            None => {
                CiCommand::Fmt.run(sh)?;
                CiCommand::Clippy.run(sh)?;
                CiCommand::Udeps.run(sh)?;
                CiCommand::NoStd.run(sh)?;
                CiCommand::Test(TestArgs::default()).run(sh)?;
                Ok(())
            }
        }
    }
}

impl CiCommand {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        match self {
            CiCommand::Fmt => common::run_fmt_check(sh),
            CiCommand::Clippy => common::run_clippy(sh),
            CiCommand::Udeps => {
                common::ensure_nightly_rustfmt(sh)?;
                if cmd!(sh, "cargo +nightly udeps --version")
                    .quiet()
                    .run()
                    .is_err()
                {
                    eprintln!("Installing cargo-udeps...");
                    cmd!(sh, "cargo +nightly install cargo-udeps --locked").run()?;
                }
                eprintln!("Running cargo udeps...");
                cmd!(sh, "cargo +nightly udeps --workspace --all-targets").run()?;
                Ok(())
            }
            CiCommand::NoStd => common::run_no_std(sh),
            CiCommand::Test(test_args) => {
                eprintln!("Running cargo test...");
                let args = &test_args.args;
                cmd!(sh, "cargo test --workspace {args...}").run()?;
                eprintln!("Running ostinato-core tests with classic jerk...");
                cmd!(sh, "cargo test -p ostinato-core --features classic-jerk {args...}").run()?;
                Ok(())
            }
        }
    }
}
