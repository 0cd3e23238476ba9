use anyhow::{Context, Result};
use clap::Args;
use ostinato::{config::Config, job::Job, sim};
use std::path::PathBuf;

#[derive(Args)]
pub struct SimulateArgs {
    /// Path to the machine configuration file (TOML or JSON).
    pub config: PathBuf,

    /// Path to the move job (TOML or JSON).
    pub job: PathBuf,

    /// Print the report as JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

impl SimulateArgs {
    pub fn run(&self) -> Result<()> {
        let config = Config::from_file(&self.config)?;
        let job = Job::from_file(&self.job)?;

        tracing::info!(
            config = %self.config.display(),
            job = %self.job.display(),
            moves = job.moves.len(),
            "starting simulation"
        );

        let report = sim::simulate(&config, &job)
            .with_context(|| format!("simulation of {} failed", self.job.display()))?;

        if self.json {
            let out = serde_json::to_string_pretty(&report).context("failed to encode report")?;
            println!("{out}");
            return Ok(());
        }

        println!("kinematics: {}", report.kinematics);
        println!(
            "moves: {} ({} rejected), blocks executed: {}",
            report.moves, report.rejected, report.blocks
        );
        println!(
            "duration: {:.3}s over {} interrupts",
            report.duration_s, report.interrupts
        );
        let p = report.final_position;
        println!("final position: x={} y={} z={} e={}", p.x, p.y, p.z, p.e);
        for (name, channel) in &report.channels {
            println!(
                "  {name}: {} pulses, position {}, {} reversals",
                channel.pulses, channel.position, channel.direction_changes
            );
        }
        if report.shaper_overflows > 0 {
            println!("shaper overflows: {}", report.shaper_overflows);
        }

        Ok(())
    }
}
