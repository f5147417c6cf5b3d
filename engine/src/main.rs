use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use nocturne_camera::{CameraController, ExposureSettings, SimulatedCamera};
use nocturne_observability::{init_process_logging, ProcessKind};
use nocturne_sequencer::{
    register_builtin_tasks, DeviceRegistry, SequenceManager, SequenceOptions,
};

#[derive(Parser, Debug)]
#[command(name = "nocturne-engine")]
#[command(about = "Astrophotography session orchestration engine")]
struct Cli {
    /// State directory for logs and the sequence database.
    #[arg(long, env = "NOCTURNE_STATE_DIR")]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a sequence file against the simulated camera.
    Run {
        sequence: PathBuf,
        /// Skip validation before execution.
        #[arg(long, default_value_t = false)]
        no_validate: bool,
    },
    /// Validate a sequence file without executing it.
    Validate { sequence: PathBuf },
    /// List registered sequence templates.
    Templates,
    /// Exercise the simulated camera: connect, expose, report statistics.
    Simulate {
        #[arg(long, default_value_t = 0.5)]
        exposure: f64,
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir.clone());
    let (_guard, log_info) =
        init_process_logging(ProcessKind::Engine, &state_dir.join("logs"), 14)?;
    info!(logs = %log_info.logs_dir, "nocturne-engine starting");

    register_builtin_tasks().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    match cli.command {
        Command::Run {
            sequence,
            no_validate,
        } => {
            let manager = build_manager(&state_dir)?;
            attach_simulated_camera().await?;
            let sequence = manager
                .load_sequence_from_file(&sequence, !no_validate)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            info!(name = %sequence.name(), targets = sequence.target_count().await, "sequence loaded");

            let (result, _) = manager
                .execute_sequence(&sequence, false)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let result = result.expect("synchronous execution returns a result");
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Validate { sequence } => {
            let manager = build_manager(&state_dir)?;
            manager
                .validate_sequence_file(&sequence)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("{} is valid", sequence.display());
        }
        Command::Templates => {
            let manager = build_manager(&state_dir)?;
            for name in manager.list_available_templates() {
                match manager.template_info(&name) {
                    Some(template) => {
                        println!("{name} ({}) - {}", template.version, template.description)
                    }
                    None => println!("{name}"),
                }
            }
        }
        Command::Simulate { exposure, count } => {
            let camera = attach_simulated_camera().await?;
            for index in 1..=count {
                camera
                    .exposure()
                    .start_exposure(ExposureSettings {
                        duration_secs: exposure,
                        width: 640,
                        height: 480,
                        ..ExposureSettings::default()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                let result = camera.exposure().wait().await;
                info!(
                    index,
                    success = result.success,
                    duration = result.actual_duration_secs,
                    "exposure finished"
                );
            }
            let stats = camera.exposure().statistics();
            println!(
                "completed={} aborted={} failed={} total_exposure_secs={:.1}",
                stats.completed, stats.aborted, stats.failed, stats.total_exposure_secs
            );
            camera
                .destroy()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    match flag {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(".nocturne"),
    }
}

fn build_manager(state_dir: &std::path::Path) -> anyhow::Result<SequenceManager> {
    SequenceManager::new(SequenceOptions {
        database_path: Some(state_dir.join("sequences.db")),
        global_timeout: Some(Duration::from_secs(12 * 3600)),
        ..SequenceOptions::default()
    })
    .map_err(|e| anyhow::anyhow!(e.to_string()))
    .context("building sequence manager")
}

async fn attach_simulated_camera() -> anyhow::Result<Arc<CameraController>> {
    let camera = Arc::new(CameraController::new(Arc::new(SimulatedCamera::new(1))));
    let name = camera
        .connect(None)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    DeviceRegistry::global().register_camera(&name, camera.clone());
    info!(device = %name, "simulated camera attached");
    Ok(camera)
}
