//! Cancel every pending timer

use crate::oneshot;
use anyhow::{Context, Result};
use debounce_core::{DebounceConfig, WireMessage};
use futures::SinkExt;
use owo_colors::OwoColorize;

pub async fn run(config: &DebounceConfig) -> Result<()> {
    let Some(mut conn) = oneshot::connect(config).await? else {
        println!("{}", "Debounce service is not running; nothing to reset".yellow());
        return Ok(());
    };

    // The service only reads from its attached client, so check we were adopted first
    if oneshot::is_rejected(&mut conn, oneshot::REJECT_WINDOW).await {
        anyhow::bail!(
            "Debounce service at {} is attached to another client; reset must come from that client",
            config.socket_path.display()
        );
    }

    conn.send(WireMessage::Reset)
        .await
        .context("Failed to send reset")?;
    conn.close().await.context("Failed to close connection")?;

    println!("{}", "Pending timers cancelled ✓".green());
    Ok(())
}
