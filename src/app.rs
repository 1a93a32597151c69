//! Application assembly: settings, shared state, control plane, lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use waveproxy_core::settings::SettingsStore;
use waveproxy_server::control::ControlPlane;

use crate::cli::RunArgs;

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let path = args
        .config
        .map(PathBuf::from)
        .unwrap_or_else(SettingsStore::default_path);
    tracing::info!(path = %path.display(), "loading settings");

    let settings = Arc::new(SettingsStore::open(path)?);
    if let Some(port) = args.port {
        settings.override_port(port);
    }

    let state = waveproxy_server::build_state(settings)?;
    tracing::info!(
        channels = state.channels.total_count(),
        "loaded channel configuration"
    );

    let control = ControlPlane::new(state);
    let status = control.proxy_start().await?;
    tracing::info!(port = status.port, version = %status.version, "waveproxy ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    control.proxy_stop().await?;
    Ok(())
}
