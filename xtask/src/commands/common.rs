use anyhow::Result;
use xshell::{Shell, cmd};

/// Bare-metal target the core crate has to keep building for.
pub const EMBEDDED_TARGET: &str = "thumbv7em-none-eabihf";

/// Ensures nightly rustfmt is available, installing if necessary
pub fn ensure_nightly_rustfmt(sh: &Shell) -> Result<()> {
    if cmd!(sh, "cargo +nightly fmt --version")
        .quiet()
        .run()
        .is_err()
    {
        eprintln!("Installing nightly rustfmt...");
        cmd!(
            sh,
            "rustup toolchain install nightly --profile minimal --component rustfmt"
        )
        .run()?;
    }
    Ok(())
}

/// Run rustfmt check (does not modify files)
pub fn run_fmt_check(sh: &Shell) -> Result<()> {
    ensure_nightly_rustfmt(sh)?;
    eprintln!("Running cargo fmt check...");
    cmd!(sh, "cargo +nightly fmt --all -- --check").run()?;
    Ok(())
}

pub fn run_fmt(sh: &Shell) -> Result<()> {
    ensure_nightly_rustfmt(sh)?;
    eprintln!("Applying cargo fmt...");
    cmd!(sh, "cargo +nightly fmt --all").run()?;
    Ok(())
}

/// Run clippy with all warnings treated as errors
pub fn run_clippy(sh: &Shell) -> Result<()> {
    eprintln!("Running cargo clippy...");
    cmd!(
        sh,
        "cargo clippy --all-features --all-targets --workspace -- -D warnings"
    )
    .run()?;
    Ok(())
}

/// Builds `ostinato-core` for a target without `std`.
///
/// Host builds link `std` through the dev-dependencies, so this is the only
/// check that catches a stray `std` import in the core.
pub fn run_no_std(sh: &Shell) -> Result<()> {
    let installed = cmd!(sh, "rustup target list --installed").read()?;
    if !installed.lines().any(|line| line.trim() == EMBEDDED_TARGET) {
        eprintln!("Installing {EMBEDDED_TARGET}...");
        cmd!(sh, "rustup target add {EMBEDDED_TARGET}").run()?;
    }
    eprintln!("Building ostinato-core for {EMBEDDED_TARGET}...");
    cmd!(
        sh,
        "cargo build -p ostinato-core --target {EMBEDDED_TARGET} --all-features"
    )
    .run()?;
    Ok(())
}
