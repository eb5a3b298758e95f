use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use irrlicht_hook::app;
use irrlicht_hook::cli::{Cli, Commands};
use irrlicht_hook::config::HookConfig;
use irrlicht_hook::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("irrlicht-hook error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let cli = Cli::parse();
    let config = HookConfig::load_or_init()?;
    setup_tracing(&config.logging);

    match cli.command {
        Some(Commands::Status { session }) => app::print_status(&config, session.as_deref()),
        Some(Commands::Analyze { path }) => {
            app::analyze(&config, &path)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        None => {
            app::run_hook(&config)?;
            Ok(0)
        }
    }
}
