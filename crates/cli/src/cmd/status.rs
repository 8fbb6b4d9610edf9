//! Show whether the service is running

use crate::oneshot;
use anyhow::Result;
use debounce_core::DebounceConfig;
use debounce_service::ServiceLock;
use owo_colors::OwoColorize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Print the service state from its lock and socket files
///
/// Only `check_client` opens a connection.
pub async fn run(config: &DebounceConfig, check_client: bool) -> Result<()> {
    let socket = &config.socket_path;
    let lock_held = ServiceLock::is_held(socket);
    let socket_present = socket.exists();

    println!("{}", "Debounce Service Status".bold());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Socket:        {}", socket.display().to_string().cyan());

    print!("Service:       ");
    if !lock_held {
        println!("{}", "Not running".yellow());
        if socket_present {
            println!("  {}", "Stale socket file will be removed on next start".dimmed());
        }
        println!("  {}", "Tip: Start with 'debounced serve'".dimmed());
        return Ok(());
    }

    if !socket_present {
        println!("{}", "Not running".yellow());
        println!("  {}", "Lock is held but the socket file is missing".red());
        return Ok(());
    }

    println!("{}", "Running ✓".green());
    if let Some(info) = ServiceLock::read_info(socket) {
        println!("  PID:         {}", info.pid);
        println!("  Uptime:      {} seconds", uptime_secs(info.started_at));
    }

    if check_client {
        print!("  Client:      ");
        match oneshot::connect(config).await? {
            Some(mut conn) => {
                if oneshot::is_rejected(&mut conn, oneshot::REJECT_WINDOW).await {
                    println!("{}", "attached".green());
                } else {
                    println!("{}", "none".dimmed());
                }
            }
            None => println!("{}", "socket is not accepting connections".red()),
        }
    }

    Ok(())
}

/// Seconds since `started_at` (unix milliseconds)
fn uptime_secs(started_at: u64) -> u64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(started_at);
    now_ms.saturating_sub(started_at) / 1000
}
