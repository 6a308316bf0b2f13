//! # Repo Guide CLI (`repo-guide`)
//!
//! Ingest a Git repository, then ask questions about it. Answers cite the
//! file and line span of every source chunk they rely on.
//!
//! ## Usage
//!
//! ```bash
//! repo-guide --config ./config/guide.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repo-guide init` | Create the SQLite database and schema |
//! | `repo-guide ingest <url>` | Clone or update a repository and index it |
//! | `repo-guide ask --namespace <ns> "<question>"` | Answer a question from one namespace |
//! | `repo-guide namespaces` | List ingested repositories, newest first |
//! | `repo-guide chat` | Interactive session over stdin |
//!
//! ## Examples
//!
//! ```bash
//! repo-guide init
//! repo-guide ingest https://github.com/acme/widgets
//! repo-guide ask --repo https://github.com/acme/widgets "How do I run the tests?"
//! OPENAI_API_KEY=sk-... repo-guide ask --namespace 3f2a... "What does this repo do?" --json
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use repo_guide::ask::{Assistant, NamespaceTarget};
use repo_guide::config;
use repo_guide::ingest::IngestReport;
use repo_guide::migrate;
use repo_guide::progress::ProgressMode;
use repo_guide::sqlite_index::format_ts_iso;
use repo_guide_core::flow::{Answer, AnswerMode};
use repo_guide_core::namespace::Namespace;
use repo_guide_core::session::ChatSession;

/// Repo Guide: grounded, citation-backed answers about a source repository.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/guide.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "repo-guide",
    about = "Ingest a Git repository and answer questions about it with cited sources",
    version,
    long_about = "Repo Guide clones or updates a Git repository, splits its files into \
    line-aligned chunks, embeds them into a namespace keyed by repository and commit, \
    and answers questions from the most relevant chunks. Without a generation model it \
    answers in retrieval-only mode, quoting the sources directly."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/guide.toml`. Database, loader, chunking,
    /// embedding, retrieval and generation settings are read from this file.
    #[arg(long, global = true, default_value = "./config/guide.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file plus the `chunk_vectors` and
    /// `namespaces` tables. Safe to run more than once.
    Init,

    /// Clone or update a repository and index it.
    ///
    /// Brings the local working copy to the tip of the branch, chunks every
    /// eligible text file, embeds the chunks and writes them under the
    /// namespace derived from the repository URL and commit. Re-ingesting
    /// the same commit overwrites instead of duplicating.
    Ingest {
        /// Repository URL (https, ssh, scp-style) or local path.
        url: String,

        /// Branch to check out; defaults to `[loader].branch`, then the
        /// remote's default branch.
        #[arg(long)]
        branch: Option<String>,

        /// Print the ingestion report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer one question from an ingested namespace.
    ///
    /// Retrieves the closest chunks, then either generates a grounded
    /// answer (when `OPENAI_API_KEY` is set) or prints a retrieval-only
    /// answer quoting the sources.
    Ask {
        #[command(flatten)]
        target: TargetArgs,

        /// The question.
        question: String,

        /// Print the answer, citations, mode and stage trace as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List ingested namespaces, most recently updated first.
    Namespaces,

    /// Interactive question answering over stdin.
    ///
    /// Lines starting with `:` are commands: `:use <namespace>`,
    /// `:ingest <url>`, `:history`, `:recent`, `:clear`, `:quit`. Anything else is a
    /// question against the active namespace. Switching namespaces clears
    /// the conversation.
    Chat {
        /// Namespace to start with.
        #[arg(long)]
        namespace: Option<String>,
    },
}

/// Which namespace `ask` queries.
#[derive(Args)]
#[group(required = true, multiple = false)]
struct TargetArgs {
    /// Namespace key printed by `ingest` or `namespaces`.
    #[arg(long)]
    namespace: Option<String>,

    /// Repository URL; uses its most recent ingestion.
    #[arg(long)]
    repo: Option<String>,
}

impl TargetArgs {
    fn target(self) -> NamespaceTarget {
        match (self.namespace, self.repo) {
            (Some(key), _) => NamespaceTarget::Key(key),
            (None, Some(url)) => NamespaceTarget::Repository(url),
            (None, None) => NamespaceTarget::Key(String::new()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { url, branch, json } => {
            let assistant = Assistant::open(&cfg).await?;
            let mode = if json {
                ProgressMode::Json
            } else {
                ProgressMode::default_for_tty()
            };
            let progress = mode.reporter();
            let report = assistant
                .ingest(&url, branch.as_deref(), progress.as_ref())
                .await
                .with_context(|| format!("Failed to ingest {}", url))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Ask {
            target,
            question,
            json,
        } => {
            let assistant = Assistant::open(&cfg).await?;
            let entry = assistant.resolve_namespace(&target.target()).await?;
            let answer = assistant.ask(&entry.namespace, &question).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
        }
        Commands::Namespaces => {
            let assistant = Assistant::open(&cfg).await?;
            let entries = assistant.namespaces().await?;
            if entries.is_empty() {
                println!("No repositories ingested yet.");
            }
            for entry in entries {
                println!(
                    "{}  {}  {:>6} chunks  {}  {}",
                    entry.namespace,
                    entry.commit.get(..12).unwrap_or(&entry.commit),
                    entry.chunk_count,
                    format_ts_iso(entry.updated_at),
                    entry.repository_url
                );
            }
        }
        Commands::Chat { namespace } => {
            let assistant = Assistant::open(&cfg).await?;
            run_chat(&assistant, namespace).await?;
        }
    }

    Ok(())
}

fn print_report(report: &IngestReport) {
    println!("Ingested {}", report.repository_url);
    println!("  namespace: {}", report.namespace);
    println!("  commit:    {} ({})", report.commit, report.branch);
    println!("  model:     {}", report.model);
    println!("  chunks:    {}", report.chunk_count);
    println!(
        "  files:     {} indexed, {} skipped",
        report.files_indexed, report.files_skipped
    );
    if report.index_failures > 0 {
        println!("  chunks not stored:   {}", report.index_failures);
    }
    if report.embedding_failures > 0 {
        println!("  chunks not embedded: {}", report.embedding_failures);
    }
    if !report.warnings.is_empty() {
        println!("  warnings:  {}", report.warnings.len());
        for warning in &report.warnings {
            println!("    {}", warning);
        }
    }
}

fn print_answer(answer: &Answer) {
    for note in &answer.notes {
        eprintln!("note: {}", note);
    }
    println!("{}", answer.answer_text.trim_end());
    if !answer.citations.is_empty() {
        println!();
        println!("Sources:");
        for (i, citation) in answer.citations.iter().enumerate() {
            println!("  [S{}] {}", i + 1, citation);
        }
    }
    if answer.mode == AnswerMode::RetrievalOnly {
        println!();
        println!("({})", answer.mode);
    }
}

/// Namespace keys are 32 lowercase hex characters; anything else is a URL.
fn looks_like_key(arg: &str) -> bool {
    arg.len() == 32 && arg.chars().all(|c| c.is_ascii_hexdigit())
}

async fn run_chat(assistant: &Assistant, namespace: Option<String>) -> Result<()> {
    let mut session = ChatSession::new();
    if let Some(key) = namespace {
        let entry = assistant
            .resolve_namespace(&NamespaceTarget::Key(key))
            .await?;
        session.set_active_namespace(entry.namespace);
    }

    if !assistant.is_generating() {
        eprintln!("No generation model configured; answering in retrieval-only mode.");
    }
    eprintln!("Type a question, or :use <namespace|url>, :ingest <url>, :history, :clear, :quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, arg) = match line.strip_prefix(':') {
            Some(rest) => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                (
                    parts.next().unwrap_or_default(),
                    parts.next().map(str::trim).unwrap_or_default(),
                )
            }
            None => {
                match assistant.ask_in_session(&mut session, line).await {
                    Ok(answer) => print_answer(&answer),
                    Err(e) => eprintln!("error: {}", e),
                }
                println!();
                continue;
            }
        };

        match command {
            "quit" | "q" | "exit" => break,
            "use" if !arg.is_empty() => {
                let target = if looks_like_key(arg) {
                    NamespaceTarget::Key(arg.to_string())
                } else {
                    NamespaceTarget::Repository(arg.to_string())
                };
                match assistant.resolve_namespace(&target).await {
                    Ok(entry) => {
                        let changed = session.set_active_namespace(entry.namespace.clone());
                        println!(
                            "Using {} @ {}{}",
                            entry.repository_url,
                            entry.commit.get(..12).unwrap_or(&entry.commit),
                            if changed { " (history cleared)" } else { "" }
                        );
                    }
                    Err(e) => eprintln!("error: {:#}", e),
                }
            }
            "ingest" if !arg.is_empty() => {
                let progress = ProgressMode::default_for_tty().reporter();
                match assistant.ingest(arg, None, progress.as_ref()).await {
                    Ok(report) => {
                        print_report(&report);
                        session.set_active_namespace(Namespace::from_key(report.namespace));
                    }
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            "history" => {
                if session.history().is_empty() {
                    println!("No questions yet.");
                }
                for (i, turn) in session.history().iter().enumerate() {
                    println!("{}. {}", i + 1, turn.question);
                    for citation in &turn.citations {
                        println!("     {}", citation);
                    }
                }
            }
            "clear" => {
                session.clear();
                println!("History cleared.");
            }
            "recent" => {
                for ns in session.recent_namespaces() {
                    println!("{}", ns);
                }
            }
            other => eprintln!("Unknown command ':{}'", other),
        }
    }

    Ok(())
}
