//! Binary entry point: wires config, store, LLM and background loops, then
//! drives supervisor turns from a minimal stdin REPL.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use brigade::config::Config;
use brigade::llm::create_llm_provider;
use brigade::model::RunStatus;
use brigade::store::{MemoryStore, PgStore, Store};
use brigade::supervisor::SupervisorRequest;
use brigade::Runtime;

#[derive(Parser, Debug)]
#[command(name = "brigade", about = "Supervisor/worker agent execution core")]
struct Args {
    /// Owner identity for this session.
    #[arg(long, env = "BRIGADE_OWNER", default_value = "local")]
    owner: String,

    /// Use the in-memory store instead of Postgres (state dies with the
    /// process).
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brigade=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let store: Arc<dyn Store> = if args.memory {
        tracing::warn!("Using in-memory store; nothing will be persisted");
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::new(&config.database)
            .await
            .context("connecting to database")?;
        store.run_migrations().await?;
        Arc::new(store)
    };

    let llm = create_llm_provider(&config.llm).context("creating LLM provider")?;
    let runtime = Runtime::build(&config, store, llm);
    let _background = runtime.start_background(&config);

    println!("brigade ready (owner: {}). Type a task, or 'quit'.", args.owner);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        if task == "quit" || task == "exit" {
            break;
        }

        let result = runtime
            .supervisor
            .run_supervisor(SupervisorRequest::new(args.owner.clone(), task))
            .await;

        match result {
            Ok(result) => match result.status {
                RunStatus::Success => {
                    println!("{}", result.result.unwrap_or_default());
                }
                RunStatus::Waiting => {
                    println!(
                        "{} (run {})",
                        result.result.unwrap_or_default(),
                        result.run_id
                    );
                }
                RunStatus::Deferred => {
                    println!("{}", result.result.unwrap_or_default());
                }
                other => {
                    println!(
                        "[{}] {}",
                        other,
                        result.error.or(result.result).unwrap_or_default()
                    );
                }
            },
            Err(e) => {
                eprintln!("error: {}", e);
            }
        }
    }

    Ok(())
}
