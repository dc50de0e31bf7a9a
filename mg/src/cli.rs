//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Morgana - event monitor for multi-agent task runs
#[derive(Parser)]
#[command(
    name = "mg",
    about = "Real-time event monitor for multi-agent task runs",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the monitor server in the foreground and print every event
    Monitor {
        /// Socket path (overrides config)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Connect to a running monitor and print replayed and live events
    Watch {
        /// Socket path (overrides config)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Append every received event to this JSONL file
        #[arg(short, long, value_name = "FILE")]
        record: Option<PathBuf>,
    },

    /// Follow an events file and print each event as it is appended
    Tail {
        /// Events file (overrides config)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_with_globals() {
        let cli = Cli::try_parse_from(["mg", "-l", "debug", "watch", "--socket", "/tmp/x.sock", "-r", "out.jsonl"])
            .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Watch { socket, record } => {
                assert_eq!(socket, Some(PathBuf::from("/tmp/x.sock")));
                assert_eq!(record, Some(PathBuf::from("out.jsonl")));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["mg"]).is_err());
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
