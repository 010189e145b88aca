use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use warden::config::{Config, SandboxSettings};
use warden::sandbox::{ExecOptions, ExecResult, ProviderType, SandboxRuntime, ScriptOptions};

#[derive(Parser)]
#[command(name = "warden", about = "Run commands in the strongest available sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered providers with availability
    Providers,
    /// Show which provider would be selected, and why
    Select,
    /// Run one command through the best provider
    Exec {
        /// Kill the command after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Working directory inside the sandbox
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Container image override (docker only)
        #[arg(long)]
        image: Option<String>,
        /// Prefer this provider type; selection still falls back when it cannot run
        #[arg(long)]
        provider: Option<String>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Run a script file, installing packages first
    RunScript {
        path: PathBuf,
        /// Directory receiving the files the script produces
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
        /// Package to install before running (repeatable)
        #[arg(long = "package")]
        packages: Vec<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            enable_logs: true,
            ..Default::default()
        },
    ));

    let runtime = SandboxRuntime::with_builtins(config.runtime_config())
        .context("failed to register built-in providers")?;
    runtime.activate().await.context("plugin activation failed")?;
    runtime.start_sweeper();

    match SandboxSettings::load(&config.settings_path)? {
        Some(settings) => {
            if let Err(e) = runtime.sync_settings(&settings).await {
                tracing::warn!(error = %e, path = %config.settings_path.display(), "ignoring persisted sandbox settings");
            }
        }
        None => tracing::debug!(path = %config.settings_path.display(), "no persisted sandbox settings"),
    }

    let outcome = run(&runtime, cli.command).await;
    runtime.shutdown().await;
    outcome
}

async fn run(runtime: &SandboxRuntime, command: Command) -> Result<ExitCode> {
    match command {
        Command::Providers => {
            let providers = runtime.list_providers().await;
            println!("{}", serde_json::to_string_pretty(&providers)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Select => {
            let selection = runtime.select_best_provider().await?;
            let summary = serde_json::json!({
                "provider": selection.provider_info(),
                "fallbackReason": selection.fallback_reason,
                "failures": selection.failures,
            });
            selection.provider.release();
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec {
            timeout_ms,
            cwd,
            image,
            provider,
            command,
        } => {
            if let Some(provider) = provider {
                runtime
                    .switch_provider(&ProviderType::from(provider), None)
                    .await
                    .context("cannot use requested provider")?;
            }
            let mut parts = command.into_iter();
            let program = parts.next().context("missing command")?;
            let mut options = ExecOptions::new(program).args(parts);
            options.cwd = cwd;
            options.image = image;
            options.timeout_millis = timeout_ms;
            let result = runtime.exec_via_best_provider(options).await?;
            Ok(report(&result))
        }
        Command::RunScript {
            path,
            work_dir,
            packages,
            timeout_ms,
            args,
        } => {
            let options = ScriptOptions {
                args,
                packages,
                timeout_millis: timeout_ms,
                ..ScriptOptions::default()
            };
            let result = runtime
                .run_script_via_best_provider(&path, &work_dir, options)
                .await?;
            Ok(report(&result))
        }
    }
}

fn report(result: &ExecResult) -> ExitCode {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if let Some(info) = &result.provider_info {
        tracing::info!(
            provider = %info.provider_type,
            isolation = %info.isolation_level,
            used_fallback = info.used_fallback,
            exit_code = result.exit_code,
            duration_ms = result.duration_millis,
            "command finished"
        );
    }
    ExitCode::from(u8::try_from(result.exit_code).unwrap_or(1))
}
