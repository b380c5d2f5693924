use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use relaymedic::channel::{ChannelStatus, ChannelType, NewChannel};
use relaymedic::config::{LogFormat, RelayConfig};
use relaymedic::jobs::planner::plan_job;
use relaymedic::jobs::{create_retry_job, ModelScope, NewTestJob, TestJob, TestJobOptions, TestMode};
use relaymedic::storage::{self, ChannelStore, JobStore};

#[derive(Parser)]
#[command(
    name = "relaymedic",
    about = "Batch health testing for upstream AI model channels",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $RELAYMEDIC_CONFIG, then /etc/relaymedic/relaymedic.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the SQLite database path from the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + job registry)
    Serve {
        /// Bind address (overrides the config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Manage upstream channels
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Create, run and inspect batch test jobs
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum ChannelAction {
    /// Register a channel
    Add {
        #[arg(long)]
        name: String,

        /// open_ai, azure, anthropic, gemini, custom, midjourney, suno, kling
        #[arg(long = "type", default_value = "open_ai")]
        channel_type: ChannelType,

        #[arg(long)]
        base_url: String,

        #[arg(long, env = "RELAYMEDIC_CHANNEL_KEY", hide_env_values = true)]
        key: String,

        /// Comma separated model names
        #[arg(long, default_value = "")]
        models: String,

        /// Default test model
        #[arg(long)]
        test_model: Option<String>,

        /// Register as manually disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List channels
    List {
        #[arg(long)]
        json: bool,
    },

    /// Re-enable a channel for batch testing
    Enable { id: i64 },

    /// Manually disable a channel (skipped unless --include-disabled)
    Disable { id: i64 },
}

#[derive(Subcommand)]
enum JobAction {
    /// Create a PENDING job (add --run to execute it right away)
    Create {
        #[command(flatten)]
        filters: JobFilters,

        #[arg(long)]
        concurrency: Option<i64>,

        #[arg(long)]
        interval_ms: Option<i64>,

        #[arg(long)]
        retry_limit: Option<i64>,

        #[arg(long, default_value = "0")]
        requester: i64,

        /// Execute in the foreground after creating
        #[arg(long)]
        run: bool,
    },

    /// Execute a PENDING job in the foreground (Ctrl-C cancels)
    Run { id: i64 },

    /// Show one job
    Show {
        id: i64,

        #[arg(long)]
        json: bool,
    },

    /// List per-model results of a job
    Results {
        id: i64,

        #[arg(long)]
        include_deleted: bool,

        #[arg(long)]
        json: bool,
    },

    /// Create a job re-testing the failures of another job
    Retry {
        id: i64,

        #[arg(long, default_value = "0")]
        requester: i64,

        #[arg(long)]
        run: bool,
    },
}

#[derive(Args)]
struct JobFilters {
    /// Channel ids to test (comma separated)
    #[arg(long, value_delimiter = ',')]
    channels: Vec<i64>,

    /// Test every channel instead of --channels
    #[arg(long)]
    all: bool,

    #[arg(long)]
    include_disabled: bool,

    /// Only test each channel's default model
    #[arg(long)]
    default_only: bool,

    /// Prepend the channel's default model when it is not listed
    #[arg(long)]
    use_channel_default: bool,

    #[arg(long, value_delimiter = ',')]
    whitelist: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    blacklist: Vec<String>,

    /// Test only these models (selected mode)
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,
}

impl JobFilters {
    fn into_options(self) -> TestJobOptions {
        TestJobOptions {
            channel_ids: self.channels,
            include_all: self.all,
            include_disabled: self.include_disabled,
            model_scope: if self.default_only {
                ModelScope::Default
            } else {
                ModelScope::All
            },
            model_whitelist: self.whitelist,
            model_blacklist: self.blacklist,
            use_channel_default: self.use_channel_default,
            test_mode: if self.models.is_empty() {
                TestMode::All
            } else {
                TestMode::Selected
            },
            target_models: self.models,
            ..Default::default()
        }
    }
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting relaymedic daemon");
            relaymedic::serve(config).await?;
        }
        Commands::Channel { action } => {
            let pool = storage::open_pool(&config.storage.db_path)?;
            let channels = ChannelStore::new(pool);
            match action {
                ChannelAction::Add {
                    name,
                    channel_type,
                    base_url,
                    key,
                    models,
                    test_model,
                    disabled,
                } => {
                    let id = channels.insert(&NewChannel {
                        name: name.clone(),
                        channel_type,
                        status: if disabled {
                            ChannelStatus::ManuallyDisabled
                        } else {
                            ChannelStatus::Enabled
                        },
                        base_url,
                        key,
                        models,
                        test_model,
                    })?;
                    println!("Channel '{}' added with id {}.", name, id);
                }
                ChannelAction::List { json } => {
                    let list = channels.list()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&list)?);
                    } else if list.is_empty() {
                        println!("No channels found.");
                    } else {
                        println!("{:<5} | {:<20} | {:<10} | {:<16} | Models", "ID", "Name", "Type", "Status");
                        println!("{:-<5}-|-{:-<20}-|-{:-<10}-|-{:-<16}-|-{:-<20}", "", "", "", "", "");
                        for ch in list {
                            println!(
                                "{:<5} | {:<20} | {:<10} | {:<16} | {}",
                                ch.id,
                                ch.name,
                                ch.channel_type,
                                format!("{:?}", ch.status),
                                ch.models
                            );
                        }
                    }
                }
                ChannelAction::Enable { id } => {
                    channels.set_status(id, ChannelStatus::Enabled)?;
                    println!("Channel {} enabled.", id);
                }
                ChannelAction::Disable { id } => {
                    channels.set_status(id, ChannelStatus::ManuallyDisabled)?;
                    println!("Channel {} disabled.", id);
                }
            }
        }
        Commands::Job { action } => run_job_action(&config, action).await?,
    }

    Ok(())
}

async fn run_job_action(config: &RelayConfig, action: JobAction) -> Result<()> {
    let pool = storage::open_pool(&config.storage.db_path)?;
    let jobs = JobStore::new(pool.clone());
    let channels = ChannelStore::new(pool);

    match action {
        JobAction::Create {
            filters,
            concurrency,
            interval_ms,
            retry_limit,
            requester,
            run,
        } => {
            let options = filters.into_options();
            let (planned_channels, tasks) = plan_job(&channels, &options)?;
            let id = jobs.create_job(&NewTestJob::with_defaults(
                &config.jobs,
                requester,
                concurrency,
                interval_ms,
                retry_limit,
                options,
            ))?;
            println!(
                "Job {} created: {} channels, {} model tests planned.",
                id,
                planned_channels.len(),
                tasks.len()
            );
            if run {
                run_in_foreground(config, id).await?;
            }
        }
        JobAction::Run { id } => run_in_foreground(config, id).await?,
        JobAction::Show { id, json } => {
            let job = jobs.get_job(id)?.with_context(|| format!("Job {} not found", id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }
        JobAction::Results {
            id,
            include_deleted,
            json,
        } => {
            jobs.get_job(id)?.with_context(|| format!("Job {} not found", id))?;
            let results = jobs.list_results(id, include_deleted)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results for job {}.", id);
            } else {
                println!("{:<6} | {:<20} | {:<24} | {:<8} | {:>8} | Error", "ID", "Channel", "Model", "Status", "ms");
                println!("{:-<6}-|-{:-<20}-|-{:-<24}-|-{:-<8}-|-{:->8}-|-{:-<20}", "", "", "", "", "", "");
                for r in results {
                    println!(
                        "{:<6} | {:<20} | {:<24} | {:<8} | {:>8} | {}",
                        r.id,
                        r.channel_name,
                        r.model_name,
                        r.status.as_str(),
                        r.duration_ms,
                        r.error_message
                    );
                }
            }
        }
        JobAction::Retry { id, requester, run } => {
            let retry_id = create_retry_job(&jobs, id, requester)?;
            println!("Retry job {} created for job {}.", retry_id, id);
            if run {
                run_in_foreground(config, retry_id).await?;
            }
        }
    }
    Ok(())
}

async fn run_in_foreground(config: &RelayConfig, id: i64) -> Result<()> {
    let registry = relaymedic::build_registry(config)?;
    let mut handle = registry.submit(id)?;

    tokio::select! {
        joined = &mut handle => joined?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(job_id = id, "Interrupted, canceling job");
            registry.cancel(id)?;
            handle.await?;
        }
    }

    let job = registry
        .runner()
        .jobs()
        .get_job(id)?
        .with_context(|| format!("Job {} not found", id))?;
    print_job(&job);
    Ok(())
}

fn print_job(job: &TestJob) {
    println!("Job {} [{}]", job.id, job.status);
    println!(
        "  tasks:    {} models across {} channels",
        job.total_models, job.total_channels
    );
    println!(
        "  progress: {} completed ({} ok, {} failed), {} canceled",
        job.completed_count, job.success_count, job.failure_count, job.cancel_count
    );
    println!(
        "  settings: concurrency {}, interval {}ms, retries {}",
        job.concurrency, job.interval_ms, job.retry_limit
    );
    if !job.error_message.is_empty() {
        println!("  message:  {}", job.error_message);
    }
}
