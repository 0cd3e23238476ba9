use anyhow::Result;
use clap::Args;
use xshell::{Shell, cmd};

#[derive(Args)]
pub struct Test {
    #[arg(long, default_value = "dev")]
    profile: String,
    /// Only run the default junction-deviation cornering model
    #[arg(long)]
    skip_classic_jerk: bool,
}

impl Test {
    pub fn run(&self, sh: &Shell) -> Result<()> {
        let profile = &self.profile;
        cmd!(sh, "cargo test --workspace --profile {profile}").run()?;

        // the cornering model is a compile-time switch
        if !self.skip_classic_jerk {
            cmd!(
                sh,
                "cargo test -p ostinato-core --features classic-jerk --profile {profile}"
            )
            .run()?;
        }

        Ok(())
    }
}
