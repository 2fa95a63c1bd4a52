//! Overseer CLI - start, stop, inspect and stream remote jobs

mod cli;
mod client;

use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use console::style;
use env_logger::Env;
use log::{info, Level};

use cli::{Cli, Commands};
use client::ApiClient;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logger(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let client = ApiClient::new(cli)?;

    match &cli.command {
        Commands::Start { command, args } => {
            info!("starting '{command}' with {} argument(s)", args.len());
            let job = client.start(command, args).await?;
            println!("{}", job.id);
        }

        Commands::Stop { id } => {
            client.stop(id).await?;
            println!("{} {}", style("stopped").red().bold(), id);
        }

        Commands::Status { id } => {
            let status = client.status(id).await?;
            print_status(&status);
        }

        Commands::Logs { id, stderr } => {
            let stdout = io::stdout();
            client.stream_logs(id, *stderr, &mut stdout.lock()).await?;
        }
    }

    Ok(())
}

/// Terse logger for a line-oriented CLI: lowercase level tag, message,
/// nothing else. `--verbose` opens up debug output, RUST_LOG still wins.
fn init_logger(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };

    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            let tag = match record.level() {
                Level::Error => style("error").red().bold(),
                Level::Warn => style("warn").yellow().bold(),
                Level::Info => style("info").green(),
                Level::Debug | Level::Trace => style("debug").dim(),
            };
            writeln!(buf, "{tag}: {}", record.args())
        })
        .init();
}

fn print_status(status: &client::JobStatus) {
    let styled = match status.status.as_str() {
        "STARTED" => style(status.status.as_str()).green().bold(),
        "DONE" => style(status.status.as_str()).blue().bold(),
        _ => style(status.status.as_str()).red().bold(),
    };

    match status.exit_code {
        Some(code) => println!("{styled} exit_code={code}"),
        None => println!("{styled}"),
    }
}
