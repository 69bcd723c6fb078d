//! Soundwatch command-line host.
//!
//! Loads a classifier, listens on the microphone (or a WAV clip) and reports
//! every detection: a log line, a JSON line on stdout, and optionally a
//! desktop notification command. Logs go to stderr.

mod cli;
mod model;
mod notifier;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use soundwatch_core::{
    audio::device::list_input_devices, AudioSource, ClassifierHandle, ClipSource, EngineStatus,
    EventNotifier, FanoutNotifier, LogNotifier, MicrophoneOptions, MicrophoneSource,
    PipelineExit, SoundwatchEngine,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use cli::{parse_args, CliAction, CliArgs, USAGE};
use model::{choose_model, load_model};
use notifier::CommandNotifier;
use settings::{default_settings_path, load_settings, save_settings, AppSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("soundwatch=info,soundwatch_core=info")),
        )
        .init();

    let args = match parse_args(std::env::args().skip(1)).context("invalid arguments")? {
        CliAction::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        CliAction::ListDevices => {
            print_devices()?;
            return Ok(());
        }
        CliAction::Run(args) => args,
    };

    let settings_path = args
        .settings_path
        .clone()
        .unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env_overrides();
    args.apply(&mut app_settings);
    info!(
        settings_path = ?settings_path,
        model_path = ?app_settings.model_path,
        labels_path = ?app_settings.labels_path,
        input_device = ?app_settings.preferred_input_device,
        pipeline_mode = %app_settings.pipeline_mode,
        "settings loaded"
    );

    if args.save_settings {
        save_settings(&settings_path, &app_settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "settings saved");
        return Ok(());
    }

    info!("Soundwatch starting");
    run(app_settings, args).await
}

fn print_devices() -> Result<()> {
    let devices = list_input_devices();
    if devices.is_empty() {
        warn!("no audio input devices found");
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

fn build_notifier(app_settings: &AppSettings) -> Result<FanoutNotifier> {
    let mut notifier = FanoutNotifier::new().with(Arc::new(LogNotifier));
    if !app_settings.notify_command.is_empty() {
        let command = CommandNotifier::new(&app_settings.notify_command)?;
        info!(program = command.program(), "desktop notifications enabled");
        notifier.push(Arc::new(command));
    }
    Ok(notifier)
}

async fn run(app_settings: AppSettings, args: CliArgs) -> Result<()> {
    let config = app_settings.engine_config();
    let notifier: Arc<dyn EventNotifier> = Arc::new(build_notifier(&app_settings)?);
    let engine = Arc::new(
        SoundwatchEngine::new(config, ClassifierHandle::default()).with_notifier(notifier),
    );

    let choice = choose_model(&app_settings, args.stub_threshold.is_some());
    {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || load_model(&engine, &choice))
            .await
            .context("model loader panicked")??;
    }

    // JSON lines on stdout for whoever is piping us.
    let mut detections = engine.subscribe_detections();
    let printer = tokio::spawn(async move {
        loop {
            match detections.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("failed to encode detection: {e}"),
                },
                Err(RecvError::Lagged(n)) => warn!("detection printer lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut status_rx = engine.subscribe_status();
    start_capture(&engine, &app_settings, args.input.clone()).await?;

    let stopped_by_user = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; stopping");
            true
        }
        _ = session_ended(&engine, &mut status_rx) => false,
    };

    let exit = {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            if stopped_by_user {
                engine.stop()
            } else {
                engine.wait()
            }
        })
        .await
        .context("capture worker join panicked")?
    };

    info!(
        diagnostics = %serde_json::to_string(&engine.diagnostics_snapshot())?,
        "session diagnostics"
    );
    if let Err(e) = engine.shutdown() {
        warn!("classifier shutdown failed: {e}");
    }
    printer.abort();

    match exit {
        Ok(PipelineExit::Fatal(e)) => {
            error!("capture session failed: {e}");
            Err(e).context("capture session failed")
        }
        Ok(exit) => {
            info!(?exit, "Soundwatch stopped");
            Ok(())
        }
        Err(e) => Err(e).context("capture session ended abnormally"),
    }
}

async fn start_capture(
    engine: &Arc<SoundwatchEngine>,
    app_settings: &AppSettings,
    input: Option<PathBuf>,
) -> Result<()> {
    let engine = Arc::clone(engine);
    let started = match input {
        Some(path) => {
            info!(clip = %path.display(), "classifying WAV clip");
            tokio::task::spawn_blocking(move || {
                engine.start(move |format, _session| {
                    Ok(Box::new(ClipSource::from_wav(&path, format)?) as Box<dyn AudioSource>)
                })
            })
            .await
        }
        None => {
            let options = MicrophoneOptions {
                preferred_device: app_settings.preferred_input_device.clone(),
                read_timeout: engine.config().read_timeout,
            };
            tokio::task::spawn_blocking(move || {
                engine.start(move |format, session| {
                    let mic = MicrophoneSource::open(format, session, options)?;
                    info!(device = mic.device_name(), "listening on microphone");
                    Ok(Box::new(mic) as Box<dyn AudioSource>)
                })
            })
            .await
        }
    };
    started
        .context("capture start panicked")?
        .context("failed to start capture")
}

/// Resolves once the worker has published a terminal status.
async fn session_ended(
    engine: &SoundwatchEngine,
    status_rx: &mut tokio::sync::broadcast::Receiver<soundwatch_core::EngineStatusEvent>,
) {
    loop {
        match status_rx.recv().await {
            Ok(event) => match event.status {
                EngineStatus::Stopped | EngineStatus::Error => {
                    if let Some(detail) = event.detail {
                        info!(status = ?event.status, "{detail}");
                    }
                    return;
                }
                status => info!(?status, "engine status"),
            },
            Err(RecvError::Lagged(_)) => {
                if !engine.is_running() {
                    return;
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}
