use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::de::DeserializeOwned;
use shared_types::{GoogleWatchRefreshResponse, MicrosoftRenewalResponse, RenewalOutcome};

#[derive(Parser)]
#[command(name = "billybot-jobs")]
#[command(about = "Run scheduled email connection jobs against the backend API")]
#[command(
    long_about = "Triggers the internal maintenance endpoints of the BillyBot backend.\n\n\
    Meant to be invoked by cron or a scheduler. Each subcommand calls one\n\
    internal endpoint, prints its report and exits non-zero on failure."
)]
struct Cli {
    /// Backend server URL to connect to.
    #[arg(
        short,
        long,
        default_value = "http://localhost:3000",
        env = "BILLYBOT_API_URL"
    )]
    base_url: String,

    /// Shared secret sent as the `x-internal-token` header.
    #[arg(long, env = "INTERNAL_JOBS_TOKEN", hide_env_values = true)]
    internal_token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Renew Microsoft Graph subscriptions that expire within 12 hours
    ///
    /// Exits with a non-zero status if any account failed to renew.
    RenewMicrosoft,

    /// Re-register Gmail watches that are missing or expire within 24 hours
    RefreshGoogleWatches,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new();

    match cli.command {
        Commands::RenewMicrosoft => renew_microsoft(&client, &cli).await?,
        Commands::RefreshGoogleWatches => refresh_google_watches(&client, &cli).await?,
    }

    Ok(())
}

async fn post_internal<T: DeserializeOwned>(
    client: &Client,
    cli: &Cli,
    path: &str,
) -> anyhow::Result<T> {
    let url = format!("{}{}", cli.base_url.trim_end_matches('/'), path);
    let response = client
        .post(&url)
        .header("x-internal-token", &cli.internal_token)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("{} returned {}: {}", path, status, body);
    }

    response
        .json()
        .await
        .with_context(|| format!("Invalid response from {}", path))
}

async fn renew_microsoft(client: &Client, cli: &Cli) -> anyhow::Result<()> {
    let report: MicrosoftRenewalResponse =
        post_internal(client, cli, "/api/internal/email/microsoft/renew").await?;

    let summary = &report.summary;
    println!(
        "Microsoft subscriptions: {} total, {} renewed, {} recreated, {} failed",
        summary.total, summary.renewed, summary.recreated, summary.failed
    );
    for result in &report.results {
        let marker = match result.status {
            RenewalOutcome::Renewed => "✓ renewed  ",
            RenewalOutcome::Recreated => "↻ recreated",
            RenewalOutcome::Error => "✗ error    ",
        };
        println!("  {} {}", marker, result.account_id);
    }

    check_renewal(&report)
}

/// Non-zero exit when any account failed to renew.
fn check_renewal(report: &MicrosoftRenewalResponse) -> anyhow::Result<()> {
    if report.summary.failed > 0 {
        bail!("{} subscription(s) failed to renew", report.summary.failed);
    }
    Ok(())
}

async fn refresh_google_watches(client: &Client, cli: &Cli) -> anyhow::Result<()> {
    let report: GoogleWatchRefreshResponse =
        post_internal(client, cli, "/api/internal/email/google/watch-refresh").await?;

    println!(
        "Gmail watches: {} due, {} refreshed, {} failed",
        report.total,
        report.updated.len(),
        report.failed
    );
    for update in &report.updated {
        println!(
            "  ✓ {} history {}",
            update.email_address,
            update.gmail_history_id.as_deref().unwrap_or("-")
        );
    }

    check_watch_refresh(&report)
}

fn check_watch_refresh(report: &GoogleWatchRefreshResponse) -> anyhow::Result<()> {
    if report.failed > 0 {
        bail!("{} watch(es) failed to refresh", report.failed);
    }
    Ok(())
}
