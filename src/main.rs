use anyhow::Context;
use clap::{Parser, Subcommand};
use previews::config::Config;
use previews::limiter::{Clock, SystemClock};
use previews::local::{ImageRenderer, LocalAccounts, LocalFileTree};
use previews::{
    AdvisoryLease, Backend, FileTree, Generator, Mode, PreGenerateError, PreviewJob, Queue,
    RunError, Runner, Scope, Worker, WorkerPartition, on_node_written, setup_database, stats,
};
use sqlx::PgPool;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pre-generate image previews from a durable queue.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file, defaults apply if it does not exist
    #[arg(short, long, default_value = "previews.toml", global = true)]
    config: PathBuf,

    /// Database URL, overrides the configuration file
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Raise the log level, may be repeated
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate previews for every file of the given accounts or paths
    GenerateAll {
        /// Accounts to scan, all known accounts if empty
        user_ids: Vec<String>,

        /// Limit the scan to this path, e.g. "/alice/files/Photos". Account
        /// arguments are ignored when given
        #[arg(short, long = "path")]
        paths: Vec<String>,

        /// Number of parallel workers
        #[arg(short, long, default_value_t = 1)]
        workers: u32,

        /// Run as one worker of a pool, e.g. '{"workerIndex": 0, "workerCount": 4}'
        #[arg(long, env = "PREVIEWS_WORKER", conflicts_with = "workers")]
        worker: Option<String>,
    },
    /// Generate previews for the queued files
    PreGenerate {
        /// Number of parallel workers
        #[arg(short, long, default_value_t = 1)]
        workers: u32,

        /// Run as one worker of a pool, e.g. '{"workerIndex": 0, "workerCount": 4}'
        #[arg(long, env = "PREVIEWS_WORKER", conflicts_with = "workers")]
        worker: Option<String>,
    },
    /// Run the periodic background job once
    Job,
    /// Show how long files have been waiting in the queue
    QueueStats {
        /// Custom age threshold in seconds, may be repeated
        #[arg(short, long = "interval")]
        intervals: Vec<i64>,
    },
    /// Queue files as if they had just been written
    Enqueue {
        /// Virtual paths such as "/alice/files/cat.png"
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Create or update the queue table
    Migrate,
}

type LocalBackend = Backend<LocalFileTree, ImageRenderer, LocalAccounts>;

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn,previews=info",
        1 => "info,previews=debug",
        _ => "debug,previews=trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();
}

fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(error) = error.downcast_ref::<RunError>() {
        error.exit_code()
    } else if let Some(error) = error.downcast_ref::<PreGenerateError>() {
        error.exit_code()
    } else {
        1
    }
}

fn scope(user_ids: Vec<String>, paths: Vec<String>) -> Scope {
    if !paths.is_empty() {
        Scope::Paths(paths)
    } else if !user_ids.is_empty() {
        Scope::Accounts(user_ids)
    } else {
        Scope::AllAccounts
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)?;
    let database_url = cli
        .database_url
        .or_else(|| config.database_url.clone())
        .context("No database URL configured")?;

    let pool = PgPool::connect(&database_url).await?;
    let queue = Queue::new(pool.clone());

    let tree = LocalFileTree::new(&config.storage.root);
    let renderer = ImageRenderer::new(tree.clone(), &config.storage.preview_root);
    let accounts = LocalAccounts::new(&config.storage.root);
    let backend: Arc<LocalBackend> = Arc::new(Backend::new(tree, renderer, accounts));

    let runner = || {
        Runner::new(queue.clone(), backend.clone(), config.previews.clone())
            .jitter(Duration::from_millis(config.job.startup_jitter_ms))
    };

    match cli.command {
        Command::Migrate => {
            setup_database(&pool).await?;
            info!("Database is up to date");
        }
        Command::PreGenerate { workers, worker } => {
            if let Some(worker) = worker {
                let partition = WorkerPartition::from_json(&worker)?;
                let mut worker = Worker::new(queue.clone(), backend.clone(), config.previews.clone())
                    .partition(partition);
                let summary = worker.run().await?;
                info!(?summary, "Worker finished");
            } else {
                let lease = AdvisoryLease::new(pool);
                let summaries = runner()
                    .num_workers(workers)
                    .run_exclusive(&lease, Mode::PreGenerate)
                    .await?;
                info!(?summaries, "Queue drained");
            }
        }
        Command::GenerateAll {
            user_ids,
            paths,
            workers,
            worker,
        } => {
            let scope = scope(user_ids, paths);
            if let Some(worker) = worker {
                let partition = WorkerPartition::from_json(&worker)?;
                let generator =
                    Generator::new(queue.clone(), backend.clone(), config.previews.clone())
                        .partition(partition);
                let summary = generator.run(&scope).await?;
                info!(?summary, "Worker finished");
            } else {
                let summaries = runner()
                    .num_workers(workers)
                    .start(Mode::GenerateAll(scope))
                    .await?
                    .wait_for_shutdown()
                    .await?;
                info!(?summaries, "Generation finished");
            }
        }
        Command::Job => {
            let job = PreviewJob::new(
                queue.clone(),
                backend.clone(),
                config.previews.clone(),
                config.job.clone(),
                Arc::new(SystemClock),
            );
            let outcome = job.run().await?;
            info!(?outcome, "Background job finished");
        }
        Command::QueueStats { intervals } => {
            let buckets = stats::collect(&queue, SystemClock.now(), &intervals).await?;
            print!("{}", stats::render_table(&buckets));
        }
        Command::Enqueue { paths } => {
            let now = SystemClock.now();
            for path in paths {
                let node = backend.files.get(&path).await?;
                match on_node_written(&queue, &backend.accounts, &node, now).await? {
                    Some(id) => info!(path = %path, id, "Queued"),
                    None => info!(path = %path, "Nothing to queue"),
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error:#}");
            ExitCode::from(exit_code(&error))
        }
    }
}
