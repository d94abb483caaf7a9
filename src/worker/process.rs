//! Launching and supervising the model-serving processes behind each slot.

use crate::worker::{format_device, WorkerClient, WorkerEndpoint, WorkerSlot};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// How to start one model-serving process.
#[derive(Debug, Clone)]
pub struct EmbedServerConfig {
    pub python_bin: String,
    pub script: PathBuf,
    pub encoder_type: String,
    pub encoder_checkpoint: PathBuf,
    pub startup_timeout: Duration,
}

/// Picks a loopback port that is free right now.
pub fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .context("failed to bind an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

pub fn embed_server_command(
    config: &EmbedServerConfig,
    device: &str,
    port: u16,
) -> Command {
    let mut command = Command::new(&config.python_bin);
    command
        .arg(&config.script)
        .arg("--model-checkpoint")
        .arg(&config.encoder_checkpoint)
        .arg("--model-type")
        .arg(&config.encoder_type)
        .arg("--device")
        .arg(format_device(device))
        .arg("--port")
        .arg(port.to_string())
        .arg("--log-prefix")
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .stdout(Stdio::inherit())
        .kill_on_drop(true);
    command
}

/// Polls until something accepts connections on `port`, or the timeout ends.
pub async fn wait_until_listening(port: u16, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow::anyhow!(
                "embed server on port {} did not start within {:?}",
                port,
                timeout
            ));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Keeps the child alive until shutdown. An unexpected exit is logged; the
/// slot stays in the pool and its later jobs fail as upstream errors.
fn supervise(
    mut child: Child,
    device: String,
    port: u16,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => error!(device = %device, port, "embed server exited: {}", status),
                Err(e) => error!(device = %device, port, "failed to wait on embed server: {}", e),
            },
            _ = shutdown.cancelled() => {
                info!(device = %device, port, "stopping embed server");
                if let Err(e) = child.kill().await {
                    warn!(device = %device, port, "failed to kill embed server: {}", e);
                }
            }
        }
    })
}

/// Starts one model-serving process per device and returns a slot for each.
#[instrument(skip(config, client, shutdown), err)]
pub async fn start_embed_servers(
    config: &EmbedServerConfig,
    devices: &[String],
    client: Arc<dyn WorkerClient>,
    shutdown: &CancellationToken,
) -> Result<(Vec<WorkerSlot>, Vec<JoinHandle<()>>)> {
    let mut slots = Vec::with_capacity(devices.len());
    let mut handles = Vec::with_capacity(devices.len());

    for (id, device) in devices.iter().enumerate() {
        let port = free_port()?;
        let child = embed_server_command(config, device, port)
            .spawn()
            .with_context(|| {
                format!("failed to start embed server for device {}", device)
            })?;
        info!(device = %format_device(device), port, "started embed server");

        handles.push(supervise(
            child,
            format_device(device),
            port,
            shutdown.clone(),
        ));
        wait_until_listening(port, config.startup_timeout).await?;

        slots.push(WorkerSlot::new(
            id,
            format_device(device),
            WorkerEndpoint::new(port),
            client.clone(),
        ));
    }

    Ok((slots, handles))
}
