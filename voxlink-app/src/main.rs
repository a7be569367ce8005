//! `voxlink`: talk to the live endpoint from the terminal.
//!
//! ```text
//! voxlink                      start a session with the saved settings
//! voxlink --list-devices       print input/output devices and exit
//! voxlink --settings <path>    use another settings file
//! voxlink --write-settings     write the effective settings file and exit
//! ```
//!
//! Ctrl-C ends the session.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use voxlink_core::audio::device::{list_input_devices, list_output_devices, DeviceInfo};
use voxlink_core::transport::ws::DEFAULT_ENDPOINT;
use voxlink_core::{CpalInput, CpalOutput, LiveConnector, SessionStatus, VoiceSession};

#[derive(Debug, Default)]
struct Args {
    settings_path: Option<PathBuf>,
    list_devices: bool,
    write_settings: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--list-devices" => args.list_devices = true,
            "--write-settings" => args.write_settings = true,
            "--settings" => {
                let path = iter.next().context("--settings needs a path")?;
                args.settings_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for d in devices {
        let mut tags = Vec::new();
        if d.is_default {
            tags.push("default");
        }
        if d.is_recommended {
            tags.push("recommended");
        }
        if d.is_loopback_like {
            tags.push("loopback?");
        }
        if tags.is_empty() {
            println!("  {}", d.name);
        } else {
            println!("  {} [{}]", d.name, tags.join(", "));
        }
    }
}

fn build_session(settings: &AppSettings, api_key: String) -> VoiceSession {
    let connector = LiveConnector::new(api_key)
        .with_endpoint(settings.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT));
    VoiceSession::new(
        settings.session_config(),
        Arc::new(CpalInput::new()),
        Arc::new(CpalOutput::new()),
        Arc::new(connector),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxlink=info,voxlink_core=info")),
        )
        .init();

    let args = parse_args()?;

    if args.list_devices {
        print_devices("Input devices", &list_input_devices());
        print_devices("Output devices", &list_output_devices());
        return Ok(());
    }

    let settings_path = args.settings_path.unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    info!(
        settings_path = ?settings_path,
        model = settings.model.as_str(),
        voice = settings.voice_name.as_str(),
        "voxlink starting"
    );

    if args.write_settings {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("writing {}", settings_path.display()))?;
        println!("wrote {}", settings_path.display());
        return Ok(());
    }

    let Some(api_key) = settings.resolve_api_key() else {
        bail!(
            "no API key: set `apiKey` in {} or export {}",
            settings_path.display(),
            settings::API_KEY_VARS.join(" / ")
        );
    };

    let session = build_session(&settings, api_key);
    let mut status = session.subscribe_status();

    session.start().await.context("starting voice session")?;
    println!("Listening. Speak any time; press Ctrl-C to end.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = status.recv() => match event {
                Ok(event) => {
                    info!(
                        status = %event.status,
                        detail = event.detail.as_deref().unwrap_or(""),
                        "session status"
                    );
                    if matches!(event.status, SessionStatus::Idle | SessionStatus::Failed) {
                        if let Some(detail) = event.detail {
                            println!("Session ended: {detail}");
                        }
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("missed {n} status events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stopping = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        error!("stop task failed: {e}");
    }

    let diagnostics = session.diagnostics();
    info!(
        frames_sent = diagnostics.frames_sent,
        frames_dropped = diagnostics.frames_dropped,
        chunks_received = diagnostics.chunks_received,
        interrupts = diagnostics.interrupts,
        "session finished"
    );
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    Ok(())
}
