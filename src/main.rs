//! Main module for the `recall` CLI.
//!
//! Parses the command line, loads the configuration, wires the store, the
//! embedding model and the generation backend together, and runs the command.
//!
//! # Examples
//!
//! ```sh
//! recall init
//! recall ask "What is the capital of France?"
//! recall ask "capital of France" --json
//! recall ask "What is in this picture?" --image cat.png
//! recall search "France" -k 5
//! recall stats
//! ```

use clap::Parser;
use once_cell::sync::OnceCell;
use std::{
    env,
    error::Error,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use chat_recall::{
    commands::{Cli, Commands},
    config::{self, RecallConfig},
    embedding::{Embedder, MiniLmEmbedder},
    generation,
    persistence::Persistence,
    policy::RetrievalPolicy,
    store::{Origin, Store},
};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(io::stderr)
            .init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config_path = config_path(&cli)?;

    match cli.command {
        Commands::Init => init(&config_path)?,
        Commands::Stats => {
            let (_, persistence, store) = open(&config_path)?;
            println!("memories:  {}", store.len());
            println!("dimension: {}", store.dimension());
            println!("artifact:  {}", persistence.path().display());
        }
        Commands::Ask {
            message,
            json,
            image,
        } => {
            let image = image
                .as_deref()
                .map(generation::encode_image)
                .transpose()?;
            let (config, persistence, store) = open(&config_path)?;
            let policy = build_policy(&config, store, persistence).await?;
            ask(&policy, &message, image.as_deref(), json).await?;
        }
        Commands::Interactive => {
            let (config, persistence, store) = open(&config_path)?;
            let policy = build_policy(&config, store, persistence).await?;
            interactive(&policy).await?;
        }
        Commands::Search { query, k } => {
            let (config, persistence, store) = open(&config_path)?;
            let config = match k {
                Some(k) => config.with_top_k(k)?,
                None => config,
            };
            let policy = build_policy(&config, store, persistence).await?;
            search(&policy, &query).await?;
        }
    }

    Ok(())
}

/// Load the config and the memory store it points at.
fn open(config_path: &Path) -> Result<(RecallConfig, Persistence, Store), Box<dyn Error>> {
    debug!("Loading config from: {}", config_path.display());
    let config = config::load_config(
        config_path
            .to_str()
            .ok_or("config path is not valid UTF-8")?,
    )?;
    debug!("Config loaded: {:?}", config);

    let persistence = Persistence::new(config.db_path()?);
    let (store, origin) = Store::open(&persistence, config.dimension);
    if let Origin::Recovered(e) = &origin {
        eprintln!(
            "warning: {} could not be read ({e}); starting with an empty memory",
            persistence.path().display()
        );
    }
    Ok((config, persistence, store))
}

/// `--config`, then `./config.yaml` under `IN_TEST_ENVIRONMENT`, then the user's config dir.
fn config_path(cli: &Cli) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(path) = &cli.config {
        return Ok(path.clone());
    }
    if env::var("IN_TEST_ENVIRONMENT").is_ok() {
        return Ok(env::current_dir()?.join("config.yaml"));
    }
    Ok(chat_recall::config_dir()?.join("config.yaml"))
}

async fn build_policy(
    config: &RecallConfig,
    store: Store,
    persistence: Persistence,
) -> Result<RetrievalPolicy, Box<dyn Error>> {
    let options = config.embedding_options();
    let embedder = tokio::task::spawn_blocking(move || MiniLmEmbedder::load(&options)).await??;
    let embedder: Arc<dyn Embedder> = Arc::new(embedder);

    Ok(RetrievalPolicy::new(
        store,
        persistence,
        embedder,
        generation::from_config(config),
        config.retrieval_settings(),
    ))
}

async fn ask(
    policy: &RetrievalPolicy,
    message: &str,
    image: Option<&str>,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let outcome = policy.respond_with_image(message, image).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.response);
    }
    if !outcome.persisted {
        eprintln!("warning: this answer is remembered for this session only");
    }
    Ok(())
}

async fn interactive(policy: &RetrievalPolicy) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else { break };
        let line = line?;
        let message = line.trim();
        if message == "exit" {
            break;
        }
        if message.is_empty() {
            continue;
        }

        // One failed question should not end the session.
        if let Err(e) = ask(policy, message, None, false).await {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

async fn search(policy: &RetrievalPolicy, query: &str) -> Result<(), Box<dyn Error>> {
    let retrieval = policy.recall(query).await?;
    if retrieval.hits.is_empty() {
        println!("No memories yet.");
        return Ok(());
    }

    let threshold = policy.settings().relevance_threshold;
    for hit in &retrieval.hits {
        let marker = if hit.similarity > threshold { '*' } else { ' ' };
        println!(
            "{marker} {:.3}  #{:<5} {}",
            hit.similarity,
            hit.id,
            hit.record.text
        );
    }
    println!(
        "{} of {} above the relevance threshold ({threshold})",
        retrieval.relevant.len(),
        retrieval.hits.len()
    );
    Ok(())
}

/// Write a default configuration and create the data directory.
///
/// An existing config file is left alone.
fn init(config_path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = config_path.parent() {
        info!("Creating config directory: {}", parent.display());
        fs::create_dir_all(parent)?;
    }

    let config = RecallConfig::default();
    if config_path.exists() {
        println!("{} already exists; not overwriting", config_path.display());
    } else {
        info!("Creating config file: {}", config_path.display());
        fs::write(config_path, serde_yaml::to_string(&config)?)?;
    }

    let db_path = config.db_path()?;
    if let Some(data_dir) = db_path.parent() {
        info!("Creating data directory: {}", data_dir.display());
        fs::create_dir_all(data_dir)?;
    }
    Ok(())
}
