//! Table and status rendering.

use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use warren_types::{ActualState, HealthStatus, NodeStatus, Timestamp};

/// A condensed table with the given header.
pub fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

pub fn success(message: impl std::fmt::Display) {
    println!("{} {message}", "✓".green());
}

/// Colors a container state for humans.
pub fn state(state: ActualState) -> String {
    match state {
        ActualState::Running => state.to_string().green().to_string(),
        ActualState::Failed => state.to_string().red().to_string(),
        ActualState::Pending | ActualState::Assigned | ActualState::Pulling => {
            state.to_string().yellow().to_string()
        }
        ActualState::Complete => state.to_string().to_string(),
    }
}

pub fn health(status: HealthStatus) -> String {
    match status {
        HealthStatus::Healthy => "healthy".green().to_string(),
        HealthStatus::Unhealthy => "unhealthy".red().to_string(),
        HealthStatus::Unknown => "unknown".to_string(),
    }
}

pub fn node_status(status: NodeStatus, drained: bool) -> String {
    if drained {
        return "drained".yellow().to_string();
    }
    match status {
        NodeStatus::Ready => "ready".green().to_string(),
        NodeStatus::Down => "down".red().to_string(),
        NodeStatus::Unknown => "unknown".to_string(),
    }
}

/// Seconds-resolution "how long ago" rendering.
pub fn ago(then: Timestamp) -> String {
    let elapsed_ms = Timestamp::now().millis_since(then);
    let seconds = elapsed_ms / 1_000;
    if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3_600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h ago", seconds / 3_600)
    } else {
        format!("{}d ago", seconds / 86_400)
    }
}
