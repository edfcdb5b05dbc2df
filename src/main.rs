use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use predictions_relay::cli::{Cli, Command};
use predictions_relay::push::{ChannelConnector, Connector, HttpConnector, TransportEvent};
use predictions_relay::replicate::{PredictionApi, ReplicateClient};
use predictions_relay::state_machine::JobStatus;
use predictions_relay::ui::{WatchProgress, WatchUpdate};
use predictions_relay::webhook::{
    SIGNATURE_PREFIX, WebhookConfig, generate_signature, validate_webhook_config,
    verify_signature,
};
use predictions_relay::{Relay, RelayConfig};

const WEBHOOK_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);
const STATUS_CHECK_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = RelayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Watch {
            prediction_id,
            webhook_url,
            webhook_secret,
            push_url,
        } => {
            let webhook = webhook_url.map(|url| WebhookConfig {
                secret: webhook_secret,
                ..WebhookConfig::new(url)
            });
            match push_url {
                Some(url) => watch_remote(&config, &url, &prediction_id, webhook).await,
                None => watch(&config, &prediction_id, webhook).await,
            }
        }
        Command::Cancel { prediction_id } => {
            let job = api_client(&config)?.cancel_prediction(&prediction_id).await?;
            println!("{} is {}", job.id, job.status);
            Ok(())
        }
        Command::Sign { file, secret } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            println!("{SIGNATURE_PREFIX}{}", generate_signature(&payload, &secret)?);
            Ok(())
        }
        Command::Verify {
            file,
            signature,
            secret,
        } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            if !verify_signature(&payload, &signature, &secret) {
                bail!("signature does not match {}", file.display());
            }
            println!("signature ok");
            Ok(())
        }
        Command::CheckWebhook {
            url,
            secret,
            max_retries,
            timeout_ms,
        } => {
            let config = WebhookConfig {
                url,
                secret,
                max_retries,
                timeout_ms,
            };
            let problems = validate_webhook_config(&config);
            if problems.is_empty() {
                println!("webhook config ok");
                return Ok(());
            }
            for problem in &problems {
                eprintln!("  - {problem}");
            }
            bail!("{} problem(s) in webhook config", problems.len());
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("warn,predictions_relay=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn api_client(config: &RelayConfig) -> Result<ReplicateClient> {
    if config.api_token.is_empty() {
        bail!("no API token: set REPLICATE_API_TOKEN or api_token in relay.toml");
    }
    Ok(ReplicateClient::with_base_url(
        config.api_token.clone(),
        config.api_base_url.clone(),
    )?)
}

/// Follows the prediction through a local push connection.
async fn watch(
    config: &RelayConfig,
    prediction_id: &str,
    webhook: Option<WebhookConfig>,
) -> Result<()> {
    let (connector, mut peers) = ChannelConnector::new();
    let relay = Relay::new(api_client(config)?, connector, config)?;

    relay.connect(&[prediction_id]).await?;
    let mut peer = peers
        .recv()
        .await
        .context("push connection was not opened")?;
    let has_webhook = webhook.is_some();
    relay.track(prediction_id, webhook)?;

    let progress = WatchProgress::start(prediction_id);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            frame = peer.recv() => {
                let Some(frame) = frame else { break };
                if let Some(update) = WatchUpdate::parse(&frame)
                    && progress.apply(&update)
                {
                    break;
                }
            }
            _ = &mut ctrl_c => {
                progress.note("interrupted");
                break;
            }
        }
    }

    finish(&relay, has_webhook).await
}

/// Publishes the prediction's notifications to a remote push server and
/// follows its status locally.
async fn watch_remote(
    config: &RelayConfig,
    push_url: &str,
    prediction_id: &str,
    webhook: Option<WebhookConfig>,
) -> Result<()> {
    let connector = HttpConnector::new(push_url)
        .with_context(|| format!("invalid push url {push_url}"))?;
    let relay = Relay::new(api_client(config)?, connector, config)?;
    let mut transport_events = relay.transport().events();

    relay
        .connect(&[prediction_id])
        .await
        .with_context(|| format!("failed to connect to {push_url}"))?;
    let has_webhook = webhook.is_some();
    relay.track(prediction_id, webhook)?;

    let progress = WatchProgress::start(prediction_id);
    let mut seen = JobStatus::Starting;
    let mut ticker = tokio::time::interval(STATUS_CHECK_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(status) = relay.last_known_status(prediction_id) else { continue };
                if status != seen {
                    let update = WatchUpdate::Status { from: seen, to: status };
                    seen = status;
                    if progress.apply(&update) {
                        break;
                    }
                }
            }
            event = transport_events.recv() => {
                if let Ok(TransportEvent::Error { message, .. }) = event {
                    progress.note(&format!("push: {message}"));
                }
            }
            _ = &mut ctrl_c => {
                progress.note("interrupted");
                break;
            }
        }
    }

    finish(&relay, has_webhook).await
}

async fn finish<A, C>(relay: &Relay<A, C>, has_webhook: bool) -> Result<()>
where
    A: PredictionApi,
    C: Connector,
{
    relay.shutdown().await;
    if has_webhook {
        let pending = relay.webhooks().pending_deliveries().len();
        if pending > 0 {
            eprintln!("waiting for {pending} webhook delivery(ies)...");
        }
        if tokio::time::timeout(WEBHOOK_DRAIN_TIMEOUT, relay.webhooks().drained())
            .await
            .is_err()
        {
            bail!("webhook deliveries still pending after {}s", WEBHOOK_DRAIN_TIMEOUT.as_secs());
        }
    }
    Ok(())
}
