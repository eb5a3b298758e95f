use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "irrlicht-hook",
    version,
    about = "Claude Code hook that tracks session state and transcript token usage"
)]
pub struct Cli {
    /// Without a subcommand, one hook event is read from stdin.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print stored session records.
    Status {
        /// Show a single session instead of all of them.
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,
    },
    /// Scan the tail of a transcript and print its metrics as JSON.
    Analyze {
        #[arg(value_name = "TRANSCRIPT")]
        path: PathBuf,
    },
    /// Run health diagnostics for the hook setup.
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from(["irrlicht-hook"]).expect("no subcommand");
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["irrlicht-hook", "status", "--session", "abc"])
            .expect("status");
        assert!(matches!(
            cli.command,
            Some(Commands::Status { session: Some(ref id) }) if id == "abc"
        ));

        let cli = Cli::try_parse_from(["irrlicht-hook", "analyze", "/tmp/t.jsonl"])
            .expect("analyze");
        assert!(matches!(
            cli.command,
            Some(Commands::Analyze { ref path }) if path == &PathBuf::from("/tmp/t.jsonl")
        ));

        assert!(Cli::try_parse_from(["irrlicht-hook", "analyze"]).is_err());
    }
}
