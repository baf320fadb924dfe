use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use nexus_core::{bootstrap, load_config, Nexus};
use nexus_memory::IndexSummary;
use nexus_schema::DEFAULT_SESSION_ID;
use nexus_server::state::AppState;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "nexus", version, about = "nexus conversational assistant")]
struct Cli {
    #[arg(
        long,
        default_value = ".",
        help = "Config root directory (contains config/, prompts/ and data/)"
    )]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the HTTP and WebSocket API server")]
    Serve {
        #[arg(long, help = "Bind address, overrides server.bind from config")]
        bind: Option<String>,
    },
    #[command(about = "Send one query through the dispatcher and print the response")]
    Ask {
        #[arg(help = "The question to ask")]
        query: String,
        #[arg(long, short = 's', default_value = DEFAULT_SESSION_ID, help = "Session id")]
        session: String,
        #[arg(long, help = "Print the full response as JSON")]
        json: bool,
    },
    #[command(about = "Validate config")]
    Validate,
    #[command(about = "List loaded retrieval indexes and their record counts")]
    Indexes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Expand ~ to home directory
    if cli.config_root.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            cli.config_root = PathBuf::from(home).join(
                cli.config_root
                    .strip_prefix("~")
                    .unwrap_or(&cli.config_root),
            );
        }
    }

    let log_dir = cli.config_root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "nexus.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Validate => {
            let config = load_config(&cli.config_root)?;
            println!(
                "Config valid. {} providers, {} pools, {} agent overrides.",
                config.providers.len(),
                config.pools.len(),
                config.agents.overrides.len()
            );
            for pool in &config.pools {
                println!(
                    "  pool {:<16} provider={:<12} keys={}",
                    pool.id,
                    pool.provider,
                    pool.key_count()
                );
            }
        }
        Commands::Serve { bind } => {
            let nexus = start(&cli.config_root)?;
            let addr = bind.unwrap_or_else(|| nexus.config.server.bind.clone());
            nexus_server::serve(AppState::from_nexus(&nexus), &addr).await?;
        }
        Commands::Ask {
            query,
            session,
            json,
        } => {
            let nexus = start(&cli.config_root)?;
            let response = nexus.dispatcher.handle_query(&query, &session).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("[{}] {}", response.agent_used, response.answer);
                if let Some(image) = &response.image {
                    println!("image: {}", image.url);
                }
            }
        }
        Commands::Indexes => {
            let nexus = start(&cli.config_root)?;
            print_index_summary(&nexus.retrieval.summary());
        }
    }

    Ok(())
}

fn start(root: &Path) -> Result<Nexus> {
    let config = load_config(root)?;
    tracing::info!(
        "starting {} ({}) from {}",
        config.app.name,
        config.app.env,
        root.display()
    );
    bootstrap(root, config)
}

fn index_lines(summary: &IndexSummary) -> Vec<String> {
    let mut lines = Vec::new();
    if summary.categories.is_empty() {
        lines.push("books: no categories loaded".to_string());
    }
    for (category, count) in &summary.categories {
        lines.push(format!("books/{category:<20} {count} records"));
    }
    for (name, size) in [
        ("memory", summary.memory),
        ("graph", summary.graph),
        ("news", summary.news),
    ] {
        match size {
            Some(count) => lines.push(format!("{name:<26} {count} records")),
            None => lines.push(format!("{name:<26} disabled")),
        }
    }
    lines
}

fn print_index_summary(summary: &IndexSummary) {
    for line in index_lines(summary) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_ask_with_session() {
        let cli = Cli::try_parse_from(["nexus", "ask", "what time is it", "-s", "web-1"]).unwrap();
        match cli.command.unwrap() {
            Commands::Ask {
                query,
                session,
                json,
            } => {
                assert_eq!(query, "what time is it");
                assert_eq!(session, "web-1");
                assert!(!json);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn ask_defaults_to_default_session() {
        let cli = Cli::try_parse_from(["nexus", "ask", "hi"]).unwrap();
        assert!(matches!(
            cli.command.unwrap(),
            Commands::Ask { session, .. } if session == DEFAULT_SESSION_ID
        ));
    }

    #[test]
    fn parses_serve_bind_and_config_root() {
        let cli =
            Cli::try_parse_from(["nexus", "--config-root", "/srv/nexus", "serve", "--bind", "0.0.0.0:9000"])
                .unwrap();
        assert_eq!(cli.config_root, PathBuf::from("/srv/nexus"));
        assert!(matches!(
            cli.command.unwrap(),
            Commands::Serve { bind: Some(addr) } if addr == "0.0.0.0:9000"
        ));
    }

    #[test]
    fn parses_validate_and_indexes() {
        let cli = Cli::try_parse_from(["nexus", "validate"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Commands::Validate));
        let cli = Cli::try_parse_from(["nexus", "indexes"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Commands::Indexes));
    }

    #[test]
    fn index_lines_mark_disabled_domains() {
        let mut summary = IndexSummary::default();
        summary.categories.insert("history".to_string(), 12);
        summary.news = Some(3);

        let lines = index_lines(&summary);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("books/history"));
        assert!(lines[0].ends_with("12 records"));
        assert!(lines[1].ends_with("disabled"));
        assert!(lines[3].ends_with("3 records"));
    }
}
