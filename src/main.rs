use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde_json::Value;

use postrag::agent::{Agent, OpenAIChat};
use postrag::config::{self, Config};
use postrag::knowledge::{
    JsonKnowledgeBase, KnowledgeFilters, LoadOptions, generate_documents,
    initialize_knowledge_filters,
};
use postrag::logging;
use postrag::posts::{PostsClient, fetch_and_save_posts};

const DEMO_QUERY: &str = "What was her terrible habit?";
const DEMO_USER_ID: u64 = 97;

#[derive(Parser)]
#[command(
    name = "postrag",
    about = "Retrieval-augmented answers over social media posts"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch posts from the posts API and write one JSON file per post.
    SavePosts {
        /// Output directory; defaults to KNOWLEDGE_DIR.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Follow pagination until every post is fetched.
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 30)]
        page_size: u64,
    },
    /// Load post files into the knowledge base with `user_id` filters.
    LoadPosts {
        /// Directory of post files; defaults to KNOWLEDGE_DIR.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Drop and re-create the table first.
        #[arg(long)]
        recreate: bool,
        /// Replace rows that share an id.
        #[arg(long)]
        upsert: bool,
    },
    /// Load every JSON file in KNOWLEDGE_DIR as-is, without filters.
    LoadFiles {
        #[arg(long)]
        recreate: bool,
        #[arg(long)]
        upsert: bool,
    },
    /// Ask the agent a question.
    Ask {
        #[arg(default_value = DEMO_QUERY)]
        query: String,
        /// Restrict knowledge to posts by this user.
        #[arg(long, default_value_t = DEMO_USER_ID)]
        user_id: u64,
        /// Extra filters as key=value; values are parsed as JSON when possible.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, Value)>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("failed to load configuration")?;
    logging::init_tracing();
    config.log_summary();

    match cli.command {
        Command::SavePosts {
            output_dir,
            all,
            page_size,
        } => save_posts(config, output_dir, all, page_size).await,
        Command::LoadPosts {
            dir,
            recreate,
            upsert,
        } => load_posts(config, dir, recreate, upsert).await,
        Command::LoadFiles { recreate, upsert } => load_files(config, recreate, upsert).await,
        Command::Ask {
            query,
            user_id,
            filters,
        } => ask(config, &query, user_id, filters).await,
    }
}

async fn save_posts(
    config: &Config,
    output_dir: Option<PathBuf>,
    all: bool,
    page_size: u64,
) -> Result<()> {
    let output_dir = output_dir.unwrap_or_else(|| config.knowledge_dir.clone());
    let client = PostsClient::new(&config.posts_api_url)?;
    let paths = fetch_and_save_posts(&client, &output_dir, all, page_size)
        .await
        .with_context(|| format!("failed to save posts to {}", output_dir.display()))?;
    println!("Saved {} posts to {}", paths.len(), output_dir.display());
    Ok(())
}

async fn load_posts(
    config: &Config,
    dir: Option<PathBuf>,
    recreate: bool,
    upsert: bool,
) -> Result<()> {
    let dir = dir.unwrap_or_else(|| config.knowledge_dir.clone());
    let documents = generate_documents(&dir)
        .with_context(|| format!("failed to read posts from {}", dir.display()))?;

    let knowledge = JsonKnowledgeBase::from_config(config)
        .await
        .context("failed to open knowledge base")?;
    initialize_knowledge_filters(&knowledge);
    if recreate {
        knowledge.vector_db().drop_table().await?;
    }

    let summary = knowledge
        .load_posts(
            documents,
            LoadOptions {
                upsert,
                skip_existing: true,
            },
        )
        .await
        .context("failed to load posts")?;
    println!(
        "Loaded {} documents: {} chunks written, {} skipped",
        summary.documents, summary.written, summary.skipped
    );
    Ok(())
}

async fn load_files(config: &Config, recreate: bool, upsert: bool) -> Result<()> {
    let knowledge = JsonKnowledgeBase::from_config(config)
        .await
        .context("failed to open knowledge base")?;
    let summary = knowledge
        .load(recreate, upsert)
        .await
        .with_context(|| format!("failed to load {}", knowledge.path().display()))?;
    println!(
        "Loaded {} files: {} chunks written, {} skipped",
        summary.documents, summary.written, summary.skipped
    );
    Ok(())
}

async fn ask(
    config: &Config,
    query: &str,
    user_id: u64,
    extra: Vec<(String, Value)>,
) -> Result<()> {
    let knowledge = JsonKnowledgeBase::from_config(config)
        .await
        .context("failed to open knowledge base")?;
    if let Err(error) = knowledge.refresh_valid_filters().await {
        tracing::warn!(error = %error, "Could not read stored filter keys");
    }
    initialize_knowledge_filters(&knowledge);

    let model = OpenAIChat::from_config(config).context("failed to configure chat model")?;
    let agent = Agent::social_media(Arc::new(model), Arc::new(knowledge));

    let mut filters = KnowledgeFilters::new();
    filters.insert("user_id".into(), Value::from(user_id));
    filters.extend(extra);

    agent
        .print_response(query, Some(&filters))
        .await
        .context("agent run failed")?;
    Ok(())
}

fn parse_filter(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("filter key must not be empty"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}
