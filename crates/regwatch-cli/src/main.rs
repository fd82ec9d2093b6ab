use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use regwatch_scan::{run_poll_loop, scanner_from_config, ScanConfig};

#[derive(Debug, Parser)]
#[command(name = "regwatch-cli")]
#[command(about = "Federal Register & SEC filing watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the aggregator inbox on a fixed interval, notifying on matches.
    Watch,
    /// Audit the full item history with side effects suppressed.
    Rescan,
    /// Manage the tracked search terms.
    Terms {
        #[command(subcommand)]
        command: TermsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TermsCommand {
    List,
    Add { term: String },
    Remove { term: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::from_env();
    let scanner = scanner_from_config(&config).await?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            run_poll_loop(Arc::new(scanner), config.refresh_interval).await;
        }
        Commands::Rescan => {
            let results = scanner.rescan().await;
            println!("{}", serde_json::to_string_pretty(&results)?);
            eprintln!("rescan complete: {} matching items", results.len());
        }
        Commands::Terms { command } => match command {
            TermsCommand::List => {
                for term in scanner.list_terms() {
                    println!("{term}");
                }
            }
            TermsCommand::Add { term } => {
                if scanner.add_term(&term).await {
                    println!("added search term: {term:?}");
                } else {
                    eprintln!("term not added (blank or already tracked): {term:?}");
                }
            }
            TermsCommand::Remove { term } => {
                if scanner.remove_term(&term).await {
                    println!("removed search term: {term:?}");
                } else {
                    eprintln!("term not removed (blank or not tracked): {term:?}");
                }
            }
        },
    }

    Ok(())
}
