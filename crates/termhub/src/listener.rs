//! TCP listener setup with single-retry port recovery.
//!
//! When the configured port is already taken, usually by a crashed previous
//! instance, the holder processes are terminated and the bind is retried
//! exactly once. Anything still holding the port after that is a real
//! conflict and startup fails.

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::net::TcpListener;

pub async fn bind_with_self_heal(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");

    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            warn!("port {port} is in use, attempting to reclaim it");
            reclaim_port(port).await?;
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("port {port} still in use after reclaim attempt"))?;
            info!("reclaimed port {port}");
            Ok(listener)
        }
        Err(e) => Err(e).with_context(|| format!("failed to bind {addr}")),
    }
}

#[cfg(unix)]
async fn reclaim_port(port: u16) -> Result<()> {
    let holders = port_holders(port);
    if holders.is_empty() {
        anyhow::bail!("port {port} is in use but no holder process was found");
    }

    for pid in &holders {
        debug!("terminating pid {pid} holding port {port}");
        let _ = std::process::Command::new("kill")
            .arg(pid.to_string())
            .status();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Escalate for anything that ignored SIGTERM.
    for pid in &holders {
        if pid_alive(*pid) {
            warn!("pid {pid} survived SIGTERM, sending SIGKILL");
            let _ = std::process::Command::new("kill")
                .args(["-9", &pid.to_string()])
                .status();
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

#[cfg(not(unix))]
async fn reclaim_port(port: u16) -> Result<()> {
    anyhow::bail!("port {port} is in use and automatic reclaim is unsupported on this platform");
}

/// Pids listening on the given TCP port, excluding this process.
#[cfg(unix)]
fn port_holders(port: u16) -> Vec<u32> {
    let output = std::process::Command::new("lsof")
        .args(["-ti", &format!("tcp:{port}")])
        .output();

    match output {
        Ok(output) => parse_pids(&String::from_utf8_lossy(&output.stdout), std::process::id()),
        Err(e) => {
            debug!("lsof unavailable: {e}");
            Vec::new()
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Parse one pid per line, dropping our own pid and anything unparseable.
fn parse_pids(stdout: &str, own_pid: u32) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid != own_pid)
        .collect()
}
