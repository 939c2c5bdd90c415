use std::cell::RefCell;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fetch_client::{FetchClient, HttpSettings, MarkerDetector, TransportMode};
use gemini_client::{GeminiClient, GeminiSettings};
use inkwash::pipeline::PipelineHooks;
use inkwash::state::{PipelineState, PipelineStateStore};
use inkwash::steps::StepContext;
use inkwash::{build_pipeline, StepHandler};
use inkwash_common::{load_default_headers, Config};
use wechat_client::WeChatClient;

#[derive(Parser)]
#[command(name = "inkwash", about = "Fetch, translate, and publish articles per channel")]
struct Cli {
    /// Path to config TOML file; defaults to $INKWASH_CONFIG or ./inkwash.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a channel's source page and store the raw artifact
    Fetch {
        #[arg(long)]
        channel: Option<String>,
        /// Fetch this URL instead of the channel's configured source
        #[arg(long)]
        url: Option<String>,
        /// Override the configured transport: auto, direct, or browser
        #[arg(long)]
        transport: Option<String>,
    },
    /// Run and manage the per-channel pipeline
    #[command(subcommand)]
    Pipeline(PipelineCommand),
}

#[derive(Subcommand)]
enum PipelineCommand {
    /// Run the pipeline from the start
    Run {
        #[arg(long)]
        channel: Option<String>,
        /// Restrict to these steps (dependencies are pulled in)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Execute everything except the final draft submission
        #[arg(long)]
        dry_run: bool,
        /// Delete the channel's generated artifacts before running
        #[arg(long)]
        overwrite: bool,
    },
    /// Continue a previous run, skipping completed steps
    Resume {
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the stored state for a channel
    Inspect {
        #[arg(long)]
        channel: Option<String>,
        /// Output format: table or json
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Delete the stored state for a channel
    Clean {
        #[arg(long)]
        channel: Option<String>,
        /// Also delete the channel's generated artifacts
        #[arg(long)]
        outputs: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("inkwash=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.log_summary();

    match cli.command {
        Command::Fetch {
            channel,
            url,
            transport,
        } => fetch_once(&config, channel.as_deref(), url, transport).await,
        Command::Pipeline(command) => match command {
            PipelineCommand::Run {
                channel,
                only,
                dry_run,
                overwrite,
            } => {
                let channel = config.resolve_channel(channel.as_deref())?;
                if overwrite {
                    remove_outputs(&config, &channel)?;
                }
                run_pipeline(&config, &channel, &only, false, dry_run).await
            }
            PipelineCommand::Resume {
                channel,
                only,
                dry_run,
            } => {
                let channel = config.resolve_channel(channel.as_deref())?;
                run_pipeline(&config, &channel, &only, true, dry_run).await
            }
            PipelineCommand::Inspect { channel, format } => {
                inspect(&config, channel.as_deref(), &format)
            }
            PipelineCommand::Clean { channel, outputs } => {
                clean(&config, channel.as_deref(), outputs)
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn fetch_once(
    config: &Config,
    channel: Option<&str>,
    url: Option<String>,
    transport: Option<String>,
) -> Result<()> {
    let channel = config.resolve_channel(channel)?;
    let config = match transport {
        Some(transport) => {
            let mut config = config.clone();
            config.http.transport = transport;
            config
        }
        None => config.clone(),
    };
    let mut ctx = build_context(&config, &channel, true)?;
    if let Some(url) = url {
        ctx.channel_config.source_url = url;
    }
    inkwash::steps::FetchStep.run(&ctx).await
}

async fn run_pipeline(
    config: &Config,
    channel: &str,
    only: &[String],
    resume: bool,
    dry_run: bool,
) -> Result<()> {
    let ctx = build_context(config, channel, dry_run)?;
    let pipeline = build_pipeline()?;
    let store = PipelineStateStore::new(&config.paths.pipeline_state_dir());

    let state = if resume {
        load_resume_state(&store, channel)?
    } else {
        PipelineState::initialize(channel, &pipeline.step_names())
    };

    let completed: HashSet<String> = if resume {
        state.completed_steps()
    } else {
        HashSet::new()
    };

    let selection = if only.is_empty() {
        None
    } else {
        Some(pipeline.dependency_closure(only)?)
    };
    if let Some(selection) = &selection {
        info!(channel, steps = selection.join(","), "Restricted step selection");
    }

    store.save(&state)?;
    let state = RefCell::new(state);
    let save = |state: &PipelineState| {
        if let Err(err) = store.save(state) {
            warn!(error = %err, "Pipeline state save failed");
        }
    };
    let mut hooks = PipelineHooks {
        before: Some(Box::new(|step: &str| {
            let mut state = state.borrow_mut();
            state.mark_running(step);
            save(&state);
        })),
        after: Some(Box::new(|step: &str| {
            let mut state = state.borrow_mut();
            state.mark_completed(step);
            save(&state);
        })),
        on_error: Some(Box::new(|step: &str, _err: &anyhow::Error| {
            let mut state = state.borrow_mut();
            state.mark_failed(step);
            save(&state);
        })),
    };

    pipeline
        .run(&ctx, selection.as_deref(), &completed, &mut hooks)
        .await?;
    info!(channel, "Pipeline finished");
    Ok(())
}

/// Resuming needs something to resume; interrupted steps go back to
/// pending so the run retries them.
fn load_resume_state(store: &PipelineStateStore, channel: &str) -> Result<PipelineState> {
    let mut state = store.load(channel).with_context(|| {
        format!("no previous pipeline run found for channel '{channel}'; use 'pipeline run'")
    })?;
    state.reset_incomplete();
    Ok(state)
}

fn inspect(config: &Config, channel: Option<&str>, format: &str) -> Result<()> {
    let channel = config.resolve_channel(channel)?;
    let store = PipelineStateStore::new(&config.paths.pipeline_state_dir());
    match store.load(&channel) {
        Some(state) if format == "json" => {
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Some(state) => {
            println!("channel:    {}", state.channel);
            println!("run id:     {}", state.run_id);
            println!("updated at: {}", state.updated_at);
            for (step, status) in &state.steps {
                println!("  {step:<12} {status:?}");
            }
        }
        None => println!("no stored state for channel '{channel}'"),
    }
    Ok(())
}

fn clean(config: &Config, channel: Option<&str>, outputs: bool) -> Result<()> {
    let channel = config.resolve_channel(channel)?;
    PipelineStateStore::new(&config.paths.pipeline_state_dir()).clean(&channel)?;
    if outputs {
        remove_outputs(config, &channel)?;
    }
    Ok(())
}

/// Delete the channel's generated artifact directories, tolerating absence.
fn remove_outputs(config: &Config, channel: &str) -> Result<()> {
    for dir in [
        config.paths.raw_for(channel),
        config.paths.translated_for(channel),
        config.paths.formatted_for(channel),
        config.paths.titles_for(channel),
    ] {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => info!(path = %dir.display(), "Removed artifacts"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("removing {}", dir.display()))
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn build_context(config: &Config, channel: &str, dry_run: bool) -> Result<StepContext> {
    let channel_config = config.channel(channel)?.clone();

    let settings = HttpSettings {
        timeout: config.http.timeout,
        min_delay: config.http.min_delay,
        max_delay: config.http.max_delay,
        max_attempts: config.http.max_attempts,
        backoff_factor: config.http.backoff_factor,
        transport: TransportMode::from_str(&config.http.transport)
            .map_err(|err| anyhow::anyhow!(err))?,
        use_captured_headers: config.http.use_captured_headers,
    };
    let fallback = load_default_headers(&config.config_dir);
    let mut fetcher = FetchClient::new(
        settings,
        &config.paths.header_jar,
        &config.paths.cookie_jar,
        &fallback,
    )?;
    if !config.http.challenge_markers.is_empty() {
        fetcher = fetcher.with_detector(Arc::new(MarkerDetector::new(
            config.http.challenge_markers.clone(),
        )));
    }

    let gemini = std::env::var("GEMINI_API_KEY").ok().map(|key| {
        GeminiClient::new(
            &key,
            GeminiSettings {
                model: config.gemini.model.clone(),
                timeout: config.gemini.timeout,
                max_retries: config.gemini.max_retries,
                backoff_seconds: config.gemini.backoff_seconds,
                temperature: config.gemini.temperature,
            },
        )
        .with_base_url(&config.gemini.base_url)
    });

    let wechat = match (
        std::env::var("WECHAT_APP_ID").ok(),
        std::env::var("WECHAT_APP_SECRET").ok(),
    ) {
        (Some(app_id), Some(secret)) => Some(
            WeChatClient::new(
                &app_id,
                &secret,
                &config.paths.state_dir.join("wechat_token.json"),
            )
            .with_base_url(&config.wechat.base_url),
        ),
        _ => None,
    };

    Ok(StepContext {
        channel: channel.to_string(),
        channel_config,
        paths: config.paths.clone(),
        dry_run,
        fetcher: Some(tokio::sync::Mutex::new(fetcher)),
        gemini,
        wechat,
    })
}
