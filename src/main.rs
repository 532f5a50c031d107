use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use forge_core::diff::{DiffEngine, DiffFormat, FileDiff};
use forge_core::jobs::{blocking_job, JobRunner, TokioJobRunner};
use forge_core::{
    commit_page, open_backend, BackendKind, ForgeConfig, OperationKey, RepositoryBackend,
    TaskStatusTracker,
};
use graph::graph_query;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forge-scm")]
#[command(
    about = "Browse history, graphs, diffs and mergeability of repositories",
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "FORGE_SCM_CONFIG")]
    config: Option<PathBuf>,

    /// Repository path, overrides the configured one
    #[arg(short, long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the commit graph payload
    Graph,
    /// List commits reachable from a revision
    Log {
        /// Starting revision (defaults to the default branch)
        rev: Option<String>,
        /// Number of commits to show
        #[arg(short, long)]
        limit: Option<usize>,
        /// Only commits touching this path
        #[arg(long)]
        path: Option<String>,
    },
    /// List branches and tags
    Branches,
    /// Paged path-level changes of a commit
    Changes {
        /// Commit to inspect
        commit: String,
        /// Compare against this revision instead of the first parent
        #[arg(long)]
        base: Option<String>,
        /// Only report paths under this prefix
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value = "0")]
        page: usize,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Line diff of one file
    Diff {
        /// Revision holding the new content
        target: String,
        /// File path
        path: String,
        /// Revision holding the old content (defaults to the first parent)
        #[arg(long)]
        base: Option<String>,
        /// Print a side-by-side table instead of a unified diff
        #[arg(long)]
        side_by_side: bool,
    },
    /// Check whether a revision merges cleanly into a branch
    MergeCheck {
        /// Revision to merge
        source: String,
        /// Branch to merge into
        target: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<ForgeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            ForgeConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => ForgeConfig::default(),
    };

    if let Some(repo) = &cli.repo {
        config.repository.kind = BackendKind::Git;
        config.repository.path = Some(repo.clone());
    } else if config.repository.kind == BackendKind::Git && config.repository.path.is_none() {
        config.repository.path = Some(PathBuf::from("."));
    }
    Ok(config)
}

/// First parent of `target`, or `None` for a root commit
fn default_base(backend: &dyn RepositoryBackend, target: &str) -> Result<Option<String>> {
    let id = backend.resolve_commit(target)?;
    let commit = backend
        .commit(&id)?
        .with_context(|| format!("Commit {} not found", id))?;
    Ok(commit.parents.first().cloned())
}

async fn merge_check(
    backend: Arc<dyn RepositoryBackend>,
    config: &ForgeConfig,
    source: String,
    target: String,
) -> Result<()> {
    let tracker = Arc::new(TaskStatusTracker::new(config.tasks.ttl()));
    let runner = TokioJobRunner::current();
    let key = OperationKey::new(format!("merge_check:{}:{}", source, target));

    let job = blocking_job(move || {
        let source = backend.resolve_commit(&source)?;
        Ok(serde_json::to_value(backend.merge_check(&source, &target)?)?)
    });
    let submitted = tracker.submit(key.clone(), |ticket| {
        runner.submit(ticket, job, tracker.clone())
    });
    debug!(job_id = %submitted.status().job_id, "merge check submitted");

    loop {
        let Some(status) = tracker.get(&key) else {
            bail!("Merge check status disappeared");
        };
        if status.state.is_terminal() {
            match (status.result, status.error) {
                (Some(result), _) => return print_json(&result),
                (None, Some(error)) => bail!("Merge check failed: {}", error),
                (None, None) => bail!("Merge check finished without a result"),
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let backend = open_backend(&config.repository).context("Failed to open repository")?;

    match cli.command {
        Commands::Graph => {
            print_json(&graph_query(backend.as_ref(), &config.graph)?)?;
        }
        Commands::Log { rev, limit, path } => {
            let rev = match rev {
                Some(rev) => rev,
                None => backend.default_branch()?,
            };
            let limit = limit.unwrap_or(config.diff.log_page_size);
            print_json(&commit_page(backend.as_ref(), &rev, path.as_deref(), limit)?)?;
        }
        Commands::Branches => {
            print_json(&backend.heads()?)?;
        }
        Commands::Changes {
            commit,
            base,
            path,
            page,
            limit,
        } => {
            let engine = DiffEngine::new(backend.as_ref());
            let limit = limit.unwrap_or(config.diff.page_size);
            match (base, path) {
                (None, None) => {
                    let id = backend.resolve_commit(&commit)?;
                    print_json(&engine.commit_changes(&id, page, limit)?)?;
                }
                (base, path) => {
                    let target = backend.resolve_commit(&commit)?;
                    let base = match base {
                        Some(base) => Some(backend.resolve_commit(&base)?),
                        None => default_base(backend.as_ref(), &target)?,
                    };
                    let limit = limit.max(1);
                    let changes = engine.changes(
                        base.as_deref(),
                        &target,
                        path.as_deref(),
                        page * limit,
                        limit,
                    )?;
                    print_json(&changes)?;
                }
            }
        }
        Commands::Diff {
            target,
            path,
            base,
            side_by_side,
        } => {
            let target = backend.resolve_commit(&target)?;
            let base = match base {
                Some(base) => Some(backend.resolve_commit(&base)?),
                None => default_base(backend.as_ref(), &target)?,
            };
            let format = if side_by_side {
                DiffFormat::SideBySide
            } else {
                DiffFormat::Unified
            };

            let diff = DiffEngine::new(backend.as_ref())
                .file_diff(base.as_deref(), &target, &path, format)?;
            match diff {
                FileDiff::Unified { text } => print!("{}", text),
                FileDiff::Binary { message } => println!("{}", message),
                table @ FileDiff::SideBySide(_) => print_json(&table)?,
            }
        }
        Commands::MergeCheck { source, target } => {
            merge_check(backend, &config, source, target).await?;
        }
    }

    Ok(())
}
