mod cli;
mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use utils::logging;
use utils::logging::LogOptions;

use crate::cli::Cli;
use crate::cli::Command;
use crate::cli::ProcessCommand;
use crate::cli::TokenCommand;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogOptions {
        json: false,
        verbose: cli.verbose,
    });

    match cli.command {
        Command::Process(ProcessCommand::List { watch, pod_id }) => {
            let mut client = client::connect(&cli.addr, cli.token.as_deref()).await?;
            if watch {
                commands::watch_processes(&mut client, pod_id).await
            } else {
                commands::list_processes(&mut client, pod_id).await
            }
        }
        Command::Process(ProcessCommand::Kill { pid, pod_id }) => {
            let mut client = client::connect(&cli.addr, cli.token.as_deref()).await?;
            commands::kill_process(&mut client, pid, pod_id).await
        }
        Command::Ping => {
            let mut client = client::connect(&cli.addr, cli.token.as_deref()).await?;
            commands::ping(&mut client).await
        }
        Command::Token(TokenCommand::Create {
            level,
            pod_id,
            subject,
            ttl_secs,
            secret,
        }) => {
            println!(
                "{}",
                commands::create_token(level, pod_id, subject, ttl_secs, &secret)?
            );
            Ok(())
        }
    }
}
