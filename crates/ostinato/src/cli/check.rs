use anyhow::Result;
use clap::Args;
use ostinato::config::Config;
use std::path::PathBuf;

#[derive(Args)]
pub struct CheckArgs {
    /// Path to the machine configuration file (TOML or JSON).
    pub config: PathBuf,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let config = Config::from_file(&self.config)?;
        config.validate()?;

        let shapers = config.shaping.channels().count();
        tracing::debug!(?config, "parsed configuration");
        println!(
            "{}: ok ({} kinematics, {} extruder(s), {} shaper(s))",
            self.config.display(),
            config.kinematics.name(),
            config.planner.extruders(),
            shapers
        );

        Ok(())
    }
}
