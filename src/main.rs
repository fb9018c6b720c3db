//! # ragchat CLI
//!
//! ```bash
//! ragchat --config ./config/ragchat.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragchat init` | Create the SQLite database and run schema migrations |
//! | `ragchat serve` | Start the HTTP server |
//! | `ragchat knowledge create` | Create a knowledge space and ingest its URLs |
//! | `ragchat knowledge resume <id>` | Re-ingest sources that are not complete |
//! | `ragchat knowledge list` | List knowledge spaces |
//! | `ragchat knowledge chunks <id>` | Show the chunks stored for a space |
//! | `ragchat agent create` | Create an agent over knowledge spaces |
//! | `ragchat chat` | Ask an agent a single question |
//!
//! With the default `memory` vector store, vectors live only as long as
//! the process. Use `serve`, or configure Qdrant, to chat against spaces
//! ingested by a separate command.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::warn;

use rag_chat::chat::{ChatRequest, CreateAgentRequest};
use rag_chat::config::{self, Config};
use rag_chat::ingest::{CreateKnowledgeSpaceRequest, IngestionReport};
use rag_chat::logging::init_tracing;
use rag_chat::services::AppServices;
use rag_chat::{migrate, server};
use rag_chat_core::models::ChatMessage;
use uuid::Uuid;

/// ragchat: retrieval-augmented chat over crawled knowledge spaces.
#[derive(Parser)]
#[command(name = "ragchat", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragchat.toml")]
    config: PathBuf,

    /// Tenant every command acts for.
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Manage knowledge spaces.
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Manage agents.
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Ask an agent one question and print the answer with its sources.
    Chat {
        /// Agent id.
        #[arg(long)]
        agent: String,

        /// User id recorded with the turn.
        #[arg(long, default_value = "cli")]
        user: String,

        /// The question.
        message: String,
    },
}

impl Commands {
    /// One-shot commands that write or read vectors.
    fn touches_vectors(&self) -> bool {
        match self {
            Commands::Knowledge { action } => !matches!(action, KnowledgeAction::List),
            Commands::Chat { .. } => true,
            Commands::Init | Commands::Serve | Commands::Agent { .. } => false,
        }
    }
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Create a knowledge space from one or more URLs and ingest them.
    Create {
        #[arg(long)]
        name: String,

        /// Source URLs (http or https).
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Re-ingest every source of a space that is not yet complete.
    Resume { id: String },

    /// List the tenant's knowledge spaces.
    List,

    /// Show the chunks stored for a knowledge space.
    Chunks {
        id: String,

        /// Print whole chunk contents instead of a one-line preview.
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Create an agent linked to existing knowledge spaces.
    Create {
        #[arg(long)]
        name: String,

        /// Knowledge space id; repeat for several.
        #[arg(long = "knowledge-space", required = true)]
        knowledge_spaces: Vec<String>,

        /// Answer from general knowledge when nothing relevant is found,
        /// instead of refusing.
        #[arg(long)]
        lenient: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging)?;

    if cli.command.touches_vectors() && !cfg.vector_store.is_persistent() {
        warn!(
            provider = %cfg.vector_store.provider,
            "vectors are not persisted across commands with this provider; \
             set [vector_store] provider = \"qdrant\" or use `ragchat serve`"
        );
    }

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Knowledge { action } => {
            let services = AppServices::from_config(&cfg).await?;
            run_knowledge(&services, &cli.tenant, action).await?;
        }
        Commands::Agent {
            action:
                AgentAction::Create {
                    name,
                    knowledge_spaces,
                    lenient,
                },
        } => {
            let services = AppServices::from_config(&cfg).await?;
            let agent = services
                .agents
                .create_agent(CreateAgentRequest {
                    tenant_id: cli.tenant,
                    name,
                    knowledge_space_ids: knowledge_spaces,
                    strict_grounding: !lenient,
                    request_id: new_request_id(),
                })
                .await?;
            println!("Created agent {} ({})", agent.id, agent.name);
            println!("  knowledge spaces: {}", agent.knowledge_space_ids.join(", "));
            println!("  strict grounding: {}", agent.strict_grounding);
        }
        Commands::Chat {
            agent,
            user,
            message,
        } => {
            run_chat(&cfg, cli.tenant, agent, user, message).await?;
        }
    }

    Ok(())
}

async fn run_knowledge(
    services: &AppServices,
    tenant: &str,
    action: KnowledgeAction,
) -> anyhow::Result<()> {
    match action {
        KnowledgeAction::Create { name, urls } => {
            let report = services
                .ingestion
                .create_knowledge_space(CreateKnowledgeSpaceRequest {
                    tenant_id: tenant.to_string(),
                    name,
                    source_urls: urls,
                    request_id: new_request_id(),
                })
                .await?;
            print_report(&report);
        }
        KnowledgeAction::Resume { id } => {
            let report = services
                .ingestion
                .resume(tenant, &id, &new_request_id())
                .await?;
            print_report(&report);
        }
        KnowledgeAction::List => {
            let spaces = services.ingestion.list(tenant).await?;
            if spaces.is_empty() {
                println!("No knowledge spaces.");
            }
            for space in spaces {
                println!(
                    "{}  {}  {}  {} sources  {}",
                    space.id,
                    space.name,
                    space.status,
                    space.sources.len(),
                    space.namespace()
                );
            }
        }
        KnowledgeAction::Chunks { id, full } => {
            let listed = services.ingestion.chunks(tenant, &id).await?;
            println!(
                "Knowledge space {}: {} chunks",
                listed.knowledge_space_id, listed.chunk_count
            );
            for chunk in &listed.chunks {
                let content = if full {
                    chunk.payload.content.clone()
                } else {
                    preview(&chunk.payload.content)
                };
                println!(
                    "  {} #{}  {}",
                    chunk.payload.url, chunk.payload.chunk_index, content
                );
            }
        }
    }
    Ok(())
}

/// First line of `content`, cut to 80 characters.
fn preview(content: &str) -> String {
    const MAX_CHARS: usize = 80;
    let line = content.lines().next().unwrap_or_default();
    if line.chars().count() > MAX_CHARS {
        let cut: String = line.chars().take(MAX_CHARS).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

async fn run_chat(
    cfg: &Config,
    tenant: String,
    agent: String,
    user: String,
    message: String,
) -> anyhow::Result<()> {
    let services = AppServices::from_config(cfg).await?;
    let completion = services
        .chat
        .chat(ChatRequest {
            tenant_id: tenant,
            user_id: user,
            agent_id: agent,
            messages: vec![ChatMessage::user(message)],
            request_id: new_request_id(),
        })
        .await?;

    println!("{}", completion.content());
    if let Some(choice) = completion.choices.first() {
        if !choice.message.cited_urls.is_empty() {
            println!();
            println!("Sources:");
            for url in &choice.message.cited_urls {
                println!("  - {}", url);
            }
        }
    }
    Ok(())
}

fn print_report(report: &IngestionReport) {
    println!(
        "Knowledge space {}: {} ({} succeeded, {} failed)",
        report.knowledge_space_id, report.status, report.successful_urls, report.failed_urls
    );
    println!("  namespace: {}", report.namespace);
    for e in &report.errors {
        println!("  failed: {}: {}", e.url, e.error);
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
