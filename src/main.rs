//! Relay CLI entry point

mod cli;

use crate::cli::{Cli, Commands, QueueCommands};
use anyhow::{Context, Result};
use clap::Parser;
use relay_sdk::{
    logging, Event, EventKind, HistoryQuery, NatsOptions, RelayConfig, RelayManager,
};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init(cli.log_level);

    let mut options = NatsOptions::default()
        .verbose(cli.verbose)
        .pedantic(cli.pedantic)
        .log_level(cli.log_level);
    if let Some(name) = &cli.name {
        options = options.name(name.clone());
    }

    let config = RelayConfig::new(&cli.nats_url, &cli.api_url, &cli.api_key).nats_options(options);

    let relay = RelayManager::new();
    relay
        .configure(config)
        .await
        .context("Invalid configuration")?;

    let result = match cli.command {
        Commands::Publish { subject, message } => publish(&relay, &subject, message).await,
        Commands::Subscribe { subject, queue } => subscribe(&relay, &subject, queue.as_deref()).await,
        Commands::Queue { command } => queue(&relay, command).await,
        Commands::History {
            subject,
            start,
            end,
            limit,
        } => {
            let mut query = HistoryQuery::new(subject).limit(limit);
            if let Some(start) = start {
                query = query.start_time(start);
            }
            if let Some(end) = end {
                query = query.end_time(end);
            }
            history(&relay, query).await
        }
    };

    if let Err(e) = relay.shutdown().await {
        warn!(error = %e, "Shutdown failed");
    }
    result
}

async fn connect(relay: &RelayManager) -> Result<()> {
    relay.on(
        &[EventKind::Reconnecting, EventKind::Error, EventKind::LameDuck],
        |event| match event {
            Event::Error(cause) => eprintln!("error: {}", cause),
            other => eprintln!("{}", other.kind()),
        },
    );

    let url = relay
        .configuration()
        .map(|c| c.nats_url.clone())
        .unwrap_or_default();
    relay
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", url))
}

async fn publish(relay: &RelayManager, subject: &str, message: String) -> Result<()> {
    connect(relay).await?;
    relay
        .publish(subject, message)
        .await
        .with_context(|| format!("Failed to publish to {}", subject))?;
    relay.disconnect().await?;

    println!("Published to {}", subject);
    Ok(())
}

async fn subscribe(relay: &RelayManager, subject: &str, queue: Option<&str>) -> Result<()> {
    connect(relay).await?;

    relay
        .subscribe(subject, queue, |msg| match msg {
            Ok(msg) => println!("[{}] {}: {}", msg.received_at.to_rfc3339(), msg.subject, msg.data),
            Err(e) => eprintln!("error: {}", e),
        })
        .await
        .with_context(|| format!("Failed to subscribe to {}", subject))?;

    info!(subject = %subject, queue = ?queue, "Listening, press Ctrl+C to stop");
    signal::ctrl_c().await.context("Failed to install Ctrl+C handler")?;

    relay.disconnect().await?;
    Ok(())
}

async fn queue(relay: &RelayManager, command: QueueCommands) -> Result<()> {
    let info = match command {
        QueueCommands::Create { name } => relay
            .create_queue(&name)
            .await
            .with_context(|| format!("Failed to create queue {}", name))?,
        QueueCommands::Info { name } => relay
            .get_queue_info(&name)
            .await
            .with_context(|| format!("Failed to get queue {}", name))?,
    };

    println!("Queue:     {}", info.name);
    println!("Messages:  {}", info.message_count);
    println!("Consumers: {}", info.consumer_count);
    println!("Created:   {}", info.created_at.to_rfc3339());
    Ok(())
}

async fn history(relay: &RelayManager, query: HistoryQuery) -> Result<()> {
    let messages = relay
        .get_history(query.clone())
        .await
        .with_context(|| format!("Failed to fetch history for {}", query.subject))?;

    if messages.is_empty() {
        println!("No messages on {}", query.subject);
        return Ok(());
    }

    for msg in messages {
        println!(
            "#{:<8} {}  {}: {}",
            msg.sequence,
            msg.timestamp.to_rfc3339(),
            msg.subject,
            msg.data
        );
    }
    Ok(())
}
