//! # Index Harness CLI (`ixh`)
//!
//! ## Usage
//!
//! ```bash
//! ixh --config ./config/ixh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ixh health` | Show document count, storage, and schema compliance |
//! | `ixh schema show` | Print the desired schema as JSON (no network) |
//! | `ixh schema plan` | Diff the desired schema against the live index |
//! | `ixh schema apply` | Apply compatible schema changes |
//! | `ixh reindex` | Pick a strategy and run it |
//! | `ixh indexer run\|reset\|status <name>` | Drive a remote indexer |
//! | `ixh check-config` | Validate the configuration file |

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use index_harness::config::{self, Config};
use index_harness::connector_fs::FilesystemCorpus;
use index_harness::embed_cache::EmbeddingCache;
use index_harness::embedding::create_provider;
use index_harness::health::HealthMonitor;
use index_harness::index_ops::{IndexClient, SearchService};
use index_harness::manifest::Manifest;
use index_harness::models::Scope;
use index_harness::progress::ProgressMode;
use index_harness::reindex::{ReindexController, ReindexRequest, RunState};
use index_harness::schema::SchemaAutomation;
use index_harness::transport::TransportClient;

/// Index Harness CLI: keep a remote search index in step with a corpus.
#[derive(Parser)]
#[command(name = "ixh", version, about = "Index automation and reindexing for remote search indexes")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ixh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a health snapshot of the configured index.
    Health {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or apply the desired schema.
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },

    /// Reindex the corpus into the configured index.
    ///
    /// The strategy (full rebuild, filtered clear, incremental, or
    /// indexer-delegated) is chosen from the schema diff and index health.
    Reindex {
        /// Plan only; issue no mutating calls.
        #[arg(long)]
        dry_run: bool,

        /// Rebuild everything (or reset the configured indexer).
        #[arg(long)]
        full: bool,

        /// Limit the run to documents where `field=value`.
        #[arg(long)]
        scope: Option<Scope>,

        /// Progress output on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Drive a remote indexer.
    Indexer {
        #[command(subcommand)]
        action: IndexerAction,
    },

    /// Validate the configuration file and exit.
    CheckConfig,
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Print the desired schema as JSON.
    Show,
    /// Diff the desired schema against the live index.
    Plan,
    /// Apply compatible changes. Never drops the index.
    Apply,
}

#[derive(Subcommand)]
enum IndexerAction {
    Run { name: String },
    Reset { name: String },
    Status { name: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn connect(cfg: &Config) -> anyhow::Result<Arc<dyn SearchService>> {
    let transport = TransportClient::new(cfg.service.transport_config())
        .context("Failed to build transport client")?;
    Ok(Arc::new(IndexClient::new(transport)))
}

fn build_controller(
    cfg: &Config,
    service: Arc<dyn SearchService>,
    progress: ProgressMode,
) -> anyhow::Result<ReindexController> {
    let corpus = Arc::new(FilesystemCorpus::new(&cfg.corpus)?);
    let manifest = match cfg.reindex.manifest_path {
        Some(ref path) => Manifest::load(path)
            .with_context(|| format!("Failed to load manifest: {}", path.display()))?,
        None => Manifest::in_memory(),
    };

    let mut controller = ReindexController::new(service, corpus, cfg.desired_schema()?)
        .with_pipeline_config(cfg.pipeline.clone())
        .with_config(cfg.reindex.clone())
        .with_manifest(manifest)
        .with_progress(progress.reporter());

    if cfg.embedding.is_enabled() {
        let provider = create_provider(&cfg.embedding)?;
        let cache = EmbeddingCache::new(provider, cfg.cache.capacity, cfg.cache.ttl());
        controller = controller.with_cache(Arc::new(cache));
    }
    Ok(controller)
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight groups");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::CheckConfig => {
            let schema = cfg.desired_schema()?;
            println!("Configuration OK: {}", cli.config.display());
            println!("  endpoint:  {}", cfg.service.endpoint);
            println!("  index:     {} ({} fields)", schema.name, schema.fields.len());
            println!("  embedding: {}", cfg.embedding.provider);
            println!(
                "  pipeline:  batch {} x {} workers, {} attempts per group",
                cfg.pipeline.batch_size, cfg.pipeline.workers, cfg.pipeline.group_attempts
            );
        }
        Commands::Schema { action } => {
            let schema = cfg.desired_schema()?;
            match action {
                SchemaAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&schema)?);
                }
                SchemaAction::Plan => {
                    let diff = SchemaAutomation::new(connect(&cfg)?).plan(&schema).await?;
                    println!("{}: {}", schema.name, diff.summary());
                }
                SchemaAction::Apply => {
                    let report = SchemaAutomation::new(connect(&cfg)?)
                        .ensure_schema(&schema)
                        .await?
                        .into_result(&schema.name)?;
                    if report.updated {
                        println!("{}: updated ({})", schema.name, report.diff.summary());
                    } else {
                        println!("{}: up to date", schema.name);
                    }
                }
            }
        }
        Commands::Health { json } => {
            let schema = cfg.desired_schema()?;
            let monitor = HealthMonitor::new(connect(&cfg)?, cfg.reindex.storage_quota_bytes);
            let snapshot = monitor.snapshot(&schema.name, Some(&schema)).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", snapshot);
            }
        }
        Commands::Reindex {
            dry_run,
            full,
            scope,
            progress,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let controller = build_controller(&cfg, connect(&cfg)?, mode)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let request = ReindexRequest {
                scope,
                dry_run,
                force_full: full,
                changed_ids: None,
            };
            let report = controller.run(&request, &cancel).await?;
            print!("{}", report);

            match report.state {
                RunState::Completed => {
                    if let Some(err) = report.partial_failure() {
                        return Err(err.into());
                    }
                }
                RunState::Cancelled => bail!("reindex cancelled"),
                RunState::Failed { ref step, ref error } => {
                    bail!("reindex failed at {}: {}", step, error)
                }
            }
        }
        Commands::Indexer { action } => {
            let service = connect(&cfg)?;
            match action {
                IndexerAction::Run { name } => {
                    service.run_indexer(&name).await?;
                    println!("indexer {}: run requested", name);
                }
                IndexerAction::Reset { name } => {
                    service.reset_indexer(&name).await?;
                    println!("indexer {}: reset", name);
                }
                IndexerAction::Status { name } => {
                    let status = service.indexer_status(&name).await?;
                    println!("indexer {}: {}", status.name, status.status);
                    if let Some(last) = status.last_result {
                        println!(
                            "  last run: {} ({} items, {} failed)",
                            last.status, last.item_count, last.failed_item_count
                        );
                        if let Some(msg) = last.error_message {
                            println!("  error: {}", msg);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
