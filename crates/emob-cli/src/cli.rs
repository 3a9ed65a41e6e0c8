//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Scan for nearby emob devices
    Scan {
        /// Scan window in milliseconds (overrides the configuration)
        #[arg(short, long)]
        duration_ms: Option<u64>,
    },
    /// Connect to a device and chat over stdin/stdout
    Chat {
        /// Transport address of the device, as printed by `scan`
        address: String,
    },
    /// Run a server and a client against each other in-process
    Demo {
        /// Message the client sends
        #[arg(short, long, default_value = "Hello")]
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_with_duration() {
        let cli = Cli::try_parse_from(["emob", "scan", "--duration-ms", "5000"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Scan {
                duration_ms: Some(5000)
            }
        );
        assert!(!cli.verbose);
    }

    #[test]
    fn test_parse_chat_requires_address() {
        assert!(Cli::try_parse_from(["emob", "chat"]).is_err());

        let cli = Cli::try_parse_from(["emob", "chat", "AA:BB:CC:DD:EE:FF", "-v"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Chat {
                address: "AA:BB:CC:DD:EE:FF".to_string()
            }
        );
        assert!(cli.verbose);
    }

    #[test]
    fn test_parse_demo_default_message() {
        let cli = Cli::try_parse_from(["emob", "--config", "emob.toml", "demo"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Demo {
                message: "Hello".to_string()
            }
        );
        assert_eq!(cli.config.as_deref(), Some("emob.toml"));
    }
}
