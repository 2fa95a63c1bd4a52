use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "overseer-ctl")]
#[command(version, about = "Run and inspect jobs on an overseer server", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Start a job and remember its ID
    overseer-ctl start echo hello world

    # Inspect and stop it
    overseer-ctl status <ID>
    overseer-ctl logs <ID>
    overseer-ctl logs --stderr <ID>
    overseer-ctl stop <ID>

    # Against a development server without TLS
    overseer-ctl --server http://localhost:9999 --insecure-http start sleep 60
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Remote server base URL
    #[arg(long, value_name = "URL", global = true, default_value = "https://localhost:9999")]
    pub server: String,

    /// Path to the user private key
    #[arg(long, value_name = "PATH", global = true, default_value = "certs/user.key")]
    pub key: PathBuf,

    /// Path to the user certificate
    #[arg(long, value_name = "PATH", global = true, default_value = "certs/user.crt")]
    pub cert: PathBuf,

    /// Path to the certificate of the Certificate Authority
    #[arg(long, value_name = "PATH", global = true, default_value = "certs/ca.crt")]
    pub ca: PathBuf,

    /// Talk plain HTTP to a server running with --insecure-http
    #[arg(long, global = true)]
    pub insecure_http: bool,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a job on the server
    Start {
        /// Program to run
        command: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Stop a running job
    Stop {
        /// Job ID
        id: String,
    },

    /// Show the status of a job
    Status {
        /// Job ID
        id: String,
    },

    /// Stream captured job output from the beginning
    Logs {
        /// Job ID
        id: String,

        /// Stream stderr instead of stdout
        #[arg(long)]
        stderr: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_hyphenated_args() {
        let cli = Cli::try_parse_from(["overseer-ctl", "start", "sh", "-c", "echo hi"]).unwrap();
        match cli.command {
            Commands::Start { command, args } => {
                assert_eq!(command, "sh");
                assert_eq!(args, vec!["-c".to_string(), "echo hi".to_string()]);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn parses_logs_with_stderr_flag() {
        let cli = Cli::try_parse_from(["overseer-ctl", "logs", "--stderr", "some-id"]).unwrap();
        match cli.command {
            Commands::Logs { id, stderr } => {
                assert_eq!(id, "some-id");
                assert!(stderr);
            }
            _ => panic!("expected logs"),
        }
    }

    #[test]
    fn global_flags_apply_after_subcommand() {
        let cli = Cli::try_parse_from([
            "overseer-ctl",
            "status",
            "some-id",
            "--server",
            "https://jobs.example:9999",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(cli.server, "https://jobs.example:9999");
        assert!(cli.verbose);
    }

    #[test]
    fn rejects_missing_subcommand() {
        assert!(Cli::try_parse_from(["overseer-ctl"]).is_err());
    }
}
