use crate::client::XferClient;
use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Instant;
use tokio::time::{interval, Duration};
use xferd_protocol::{CommandRequest, Notification};

pub async fn handle_submit(
    client: XferClient,
    request: CommandRequest,
    wait: Option<Duration>,
    format: &str,
) -> Result<()> {
    let command = request.command.name();
    let async_key = client.submit(request).await?;

    if format == "json" {
        println!("{}", serde_json::json!({
            "async_key": async_key,
            "command": command,
            "status": "in_progress"
        }));
    } else {
        println!("{} Submitted {}: {}",
            style("✓").green(),
            command,
            style(&async_key).cyan()
        );
    }

    if let Some(timeout) = wait {
        wait_for_result(&client, &async_key, timeout, format).await?;
    }

    Ok(())
}

pub async fn handle_results(client: XferClient, limit: usize, format: &str) -> Result<()> {
    let notifications = client.recent_results(limit).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&notifications)?);
    } else if notifications.is_empty() {
        println!("No results reported yet");
    } else {
        for notification in &notifications {
            print_notification(notification);
        }
    }

    Ok(())
}

pub async fn handle_stats(client: XferClient, format: &str) -> Result<()> {
    let stats = client.get_stats().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Active jobs: {}", stats.active_jobs);
        for line in stats.metrics.lines().filter(|line| !line.starts_with('#')) {
            println!("  {}", line);
        }
    }

    Ok(())
}

pub async fn handle_health(client: XferClient, format: &str) -> Result<()> {
    let health = client.health_check().await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        let status_icon = if health.healthy {
            style("✓").green()
        } else {
            style("✗").red()
        };

        println!("{} Daemon status: {}",
            status_icon,
            if health.healthy { style("HEALTHY").green() } else { style("UNHEALTHY").red() }
        );
        println!("  Version: {}", health.version);
        println!("  Uptime: {}", format_duration(health.uptime_secs));
    }

    Ok(())
}

async fn wait_for_result(
    client: &XferClient,
    async_key: &str,
    timeout: Duration,
    format: &str,
) -> Result<()> {
    let spinner = if format == "json" {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    spinner.set_message(format!("Waiting for {}", async_key));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let started = Instant::now();
    let mut ticker = interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;

        if let Some(notification) = client.find_result(async_key).await? {
            spinner.finish_and_clear();
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&notification)?);
            } else {
                print_notification(&notification);
            }
            if !notification.result.success {
                anyhow::bail!("{} failed: {}", async_key, notification.result.message);
            }
            return Ok(());
        }

        if started.elapsed() >= timeout {
            spinner.finish_with_message(format!("No result for {} yet", async_key));
            // A config apply reports only after the device has rebooted.
            anyhow::bail!("Timed out after {}", format_duration(timeout.as_secs()));
        }
    }
}

fn print_notification(notification: &Notification) {
    let result = &notification.result;
    let status = if result.success {
        style("SUCCESS").green()
    } else {
        style("FAILED").red()
    };

    println!("{} {} {} [{}]",
        notification.timestamp.format("%Y-%m-%d %H:%M:%S"),
        style(&notification.async_key).cyan(),
        status,
        notification.model_name
    );
    println!("  {}", notification.service_id);
    println!("  code {} {}: {}", result.code, result.kind, result.message);
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m {}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3723), "1h 2m 3s");
    }
}
