//! Per-container health probes.
//!
//! One long-lived prober per container with a health check: runs the
//! configured probe on its interval, declares healthy after one success
//! and unhealthy after `retries` consecutive failures, and emits only
//! verdict *changes* (steady state is debounced). Before the first
//! verdict the status is unknown.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

use warren_types::{ContainerId, HealthCheckSpec, HealthStatus, Probe};

use crate::runtime::{ContainerRuntime, RuntimeState};

/// A change of verdict for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub container_id: ContainerId,
    pub status: HealthStatus,
}

/// Runs the probe loop for one container until the channel closes or the
/// container disappears from the runtime.
pub async fn probe_loop(
    container_id: ContainerId,
    runtime_id: String,
    check: HealthCheckSpec,
    runtime: Arc<dyn ContainerRuntime>,
    events: mpsc::Sender<HealthEvent>,
) {
    let interval = Duration::from_millis(check.interval_ms.max(100));
    let timeout = Duration::from_millis(check.timeout_ms.max(100));
    let mut failures: u32 = 0;
    let mut verdict = HealthStatus::Unknown;

    loop {
        tokio::time::sleep(interval).await;

        let inspection = match runtime.inspect(&runtime_id).await {
            Ok(inspection) => inspection,
            Err(_) => continue,
        };
        match inspection.state {
            RuntimeState::Running => {}
            RuntimeState::Missing | RuntimeState::Exited => return,
            RuntimeState::Created => continue,
        }

        let healthy = tokio::time::timeout(
            timeout,
            run_probe(&check.probe, &runtime_id, inspection.ip_address.as_deref(), &runtime),
        )
        .await
        .unwrap_or(false);

        let next = if healthy {
            failures = 0;
            HealthStatus::Healthy
        } else {
            failures += 1;
            if failures >= check.retries {
                HealthStatus::Unhealthy
            } else {
                // Not yet past the retry budget; keep the last verdict.
                verdict
            }
        };

        if next != verdict {
            debug!(container = %container_id, ?next, "health verdict changed");
            verdict = next;
            let event = HealthEvent {
                container_id: container_id.clone(),
                status: verdict,
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

/// One probe attempt. The deadline is applied by the caller.
async fn run_probe(
    probe: &Probe,
    runtime_id: &str,
    ip_address: Option<&str>,
    runtime: &Arc<dyn ContainerRuntime>,
) -> bool {
    match probe {
        Probe::Tcp { port } => {
            let Some(ip) = ip_address else { return false };
            tokio::net::TcpStream::connect((ip, *port)).await.is_ok()
        }
        Probe::Http { path, port } => {
            let Some(ip) = ip_address else { return false };
            http_get_ok(ip, *port, path).await
        }
        Probe::Exec { command } => match runtime.exec(runtime_id, command).await {
            Ok(code) => code == 0,
            Err(_) => false,
        },
    }
}

/// A one-shot HTTP GET; any 2xx or 3xx status line counts as healthy.
async fn http_get_ok(ip: &str, port: u16, path: &str) -> bool {
    let Ok(mut stream) = tokio::net::TcpStream::connect((ip, port)).await else {
        return false;
    };
    let request = format!("GET {path} HTTP/1.1\r\nHost: {ip}\r\nConnection: close\r\n\r\n");
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut buf = vec![0u8; 512];
    let mut filled = 0;
    loop {
        use tokio::io::AsyncReadExt;
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled >= buf.len() || buf[..filled].contains(&b'\n') {
                    break;
                }
            }
            Err(_) => return false,
        }
    }

    // "HTTP/1.1 200 OK" -> the status code starts at byte 9.
    let line = String::from_utf8_lossy(&buf[..filled]);
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..400).contains(&code))
}
