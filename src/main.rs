use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ragdesk::config::State;
use ragdesk::corpus::load_corpus;
use ragdesk::prompt::{build_prompt, NO_CONTEXT_REPLY};
use ragdesk::{embedder, reindex, FileIndexStore, IndexStore, Retriever};

#[derive(Parser)]
#[command(name = "ragdesk")]
#[command(version = "0.1")]
#[command(about = "Retrieval core for a support-ticket RAG bot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the index from a JSON Lines corpus
    Index {
        #[arg(long)]
        corpus: Option<String>,
    },
    /// Find the closest corpus entries (query from argument or stdin)
    Search {
        query: Option<String>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Print the prompt messages for the generation service
    Context {
        query: Option<String>,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// List indexed records
    List,
    /// Show the current index generation
    Status,
    /// Print the effective configuration
    Config,
}

fn init_tracing(state: &State) {
    let default_level = if state.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn read_query(query: Option<String>) -> Result<String> {
    match query {
        Some(q) => Ok(q),
        None => {
            let mut input = String::new();
            io::stdin().lock().read_line(&mut input)?;
            Ok(input.trim_end_matches(['\r', '\n']).to_string())
        }
    }
}

fn open_retriever(state: &State) -> Result<Retriever> {
    let store = FileIndexStore::new(&state.index_dir, state.keep_generations);
    let retriever = Retriever::new(embedder::from_state(state)?);
    retriever
        .load_from(&store)
        .with_context(|| format!("Failed to load index from '{}'. Run `ragdesk index` first.", state.index_dir))?;
    Ok(retriever)
}

fn index_command(state: &State, corpus: Option<String>) -> Result<()> {
    let corpus_path = corpus.unwrap_or_else(|| state.corpus_path.clone());
    let records = load_corpus(Path::new(&corpus_path))
        .with_context(|| format!("Failed to read corpus '{}'", corpus_path))?;

    let embedder = embedder::from_state(state)?;
    let store = FileIndexStore::new(&state.index_dir, state.keep_generations);
    let outcome = reindex(records, embedder.as_ref(), &store, state.metric)
        .with_context(|| format!("Failed to build index from '{}'", corpus_path))?;

    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

fn search_command(state: &State, query: Option<String>, top_k: Option<usize>) -> Result<()> {
    let query = read_query(query)?;
    let top_k = top_k.unwrap_or(state.top_k);
    let retriever = open_retriever(state)?;
    let snapshot = retriever.snapshot()?;

    let results = retriever.search(&query, top_k)?;
    debug!(
        "All distances: {:?}",
        results.iter().map(|r| (r.record.id, r.distance)).collect::<Vec<_>>()
    );

    let output = serde_json::json!({
        "query": query,
        "generation": snapshot.generation(),
        "database_record_count": snapshot.records().len(),
        "results": results,
        "actual_results_count": results.len(),
        "requested_results_count": top_k,
    });

    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn context_command(state: &State, query: Option<String>, top_k: Option<usize>) -> Result<()> {
    let query = read_query(query)?;
    let retriever = open_retriever(state)?;
    let results = retriever.search(&query, top_k.unwrap_or(state.top_k))?;

    let output = match build_prompt(&query, &results) {
        Some(messages) => serde_json::json!({ "messages": messages, "reply": null }),
        None => serde_json::json!({ "messages": null, "reply": NO_CONTEXT_REPLY }),
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn list_command(state: &State) -> Result<()> {
    let store = FileIndexStore::new(&state.index_dir, state.keep_generations);
    let snapshot = store.load()?;
    for record in snapshot.records().iter() {
        println!("{}\t{}", record.id, record.query);
    }
    Ok(())
}

fn status_command(state: &State) -> Result<()> {
    let store = FileIndexStore::new(&state.index_dir, state.keep_generations);
    let snapshot = store.load()?;
    let output = serde_json::json!({
        "manifest": snapshot.manifest(),
        "generations": store.generations()?,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn config_command(state: &State) -> Result<()> {
    state.print_config();
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let state = State::new()?;
    init_tracing(&state);

    match args.command {
        Commands::Index { corpus } => index_command(&state, corpus)?,
        Commands::Search { query, top_k } => search_command(&state, query, top_k)?,
        Commands::Context { query, top_k } => context_command(&state, query, top_k)?,
        Commands::List => list_command(&state)?,
        Commands::Status => status_command(&state)?,
        Commands::Config => config_command(&state)?,
    }
    Ok(())
}
