use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volley::cli::config::Config;
use volley::cli::{Cli, Commands};
use volley::engine::control::ControlState;
use volley::engine::Engine;

fn run(path: &Path, json: bool, export_json: Option<&Path>) -> Result<()> {
    let scenario = Config::from_path(path)?.into_scenario()?;
    let threads = Engine::runtime_threads(scenario.schedule.max_target());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let summary = runtime.block_on(async move {
        let engine = Engine::with_http_client(scenario);
        let control = Arc::new(ControlState::new());
        {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping");
                    control.stop();
                }
            });
        }
        info!(threads, "runtime ready");
        engine.run(control).await
    });

    if json {
        println!("{}", summary.report.to_json());
    } else {
        summary.report.print_summary();
    }

    if let Some(out) = export_json {
        std::fs::write(out, summary.report.to_json())
            .with_context(|| format!("failed to write {:?}", out))?;
        println!("Summary written to {:?}", out);
    }

    if !summary.passed() {
        for failure in &summary.threshold_failures {
            eprintln!("{}", failure);
        }
        bail!("{} threshold(s) failed", summary.threshold_failures.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "volley=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            json,
            export_json,
        } => run(&scenario, json, export_json.as_deref()),
        Commands::Validate { scenario } => {
            volley::cli::validate::run_validate(&scenario)?;
            Ok(())
        }
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "volley", &mut std::io::stdout());
            Ok(())
        }
    }
}
