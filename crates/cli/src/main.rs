//! Gmail push relay entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration** from flags and environment, refusing to start
//!    while any required setting is missing.
//! 2. **Wire observability**: `tracing-subscriber` with a JSON (or text) layer
//!    and, when configured, an OpenTelemetry OTLP exporter.
//! 3. **Construct infrastructure**: the Gmail fetcher, Jenkins trigger and
//!    optional GitHub verifier, injected into the [`dispatch::Dispatcher`].
//! 4. **Serve** the HTTP surface with the eviction sweeper running alongside,
//!    until Ctrl-C or SIGTERM.

mod args;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dispatch::{spawn_sweeper, Collaborators, Dispatcher};
use gmail::{AccessTokenSource, GmailMessageFetcher, ServiceAccountTokenSource, StaticToken};
use github::GitHubActivityVerifier;
use jenkins::JenkinsJobTrigger;
use listener::AppState;
use pipeline::{
    ActivityVerifier, HistoryId, MailboxId, MessageId, NotificationPayload, OriginAuthenticator,
    SignatureConfig, Timestamp, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use secrecy::SecretString;
use tokio::sync::watch;

use crate::args::{Cli, Command, GmailAuth, SampleArgs, ServeArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Sample(args) => sample(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let telemetry = telemetry::init(args.log_format, args.otlp_endpoint.as_deref())
        .context("failed to initialise telemetry")?;
    let result = run(args).await;
    if let Err(e) = &result {
        tracing::error!(error = format!("{e:#}"), "relay stopped with error");
    }
    telemetry.shutdown();
    result
}

async fn run(args: ServeArgs) -> anyhow::Result<()> {
    let settings = args.into_settings()?;

    let verifier: Option<Arc<dyn ActivityVerifier>> = match settings.github {
        Some(config) => Some(Arc::new(
            GitHubActivityVerifier::new(config).context("failed to build GitHub client")?,
        )),
        None => None,
    };
    let tokens: Arc<dyn AccessTokenSource> = match settings.gmail_auth {
        GmailAuth::ServiceAccount {
            key,
            subject,
            scope,
        } => {
            tracing::info!(
                client_email = %key.client_email,
                %subject,
                scope,
                "using service account for Gmail"
            );
            Arc::new(
                ServiceAccountTokenSource::new(key, subject, scope, settings.gmail.timeout)
                    .context("failed to load Gmail service account")?,
            )
        }
        GmailAuth::Static(token) => {
            tracing::warn!("using a fixed Gmail access token; it will not be refreshed");
            Arc::new(StaticToken::new(token))
        }
    };
    let collaborators = Collaborators {
        fetcher: Arc::new(
            GmailMessageFetcher::new(settings.gmail, tokens)
                .context("failed to build Gmail client")?,
        ),
        verifier,
        trigger: Arc::new(
            JenkinsJobTrigger::new(settings.jenkins).context("failed to build Jenkins client")?,
        ),
    };
    let dispatcher = Arc::new(
        Dispatcher::new(settings.pipeline, settings.webhook_secret, collaborators)
            .context("invalid pipeline configuration")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(Arc::clone(&dispatcher), settings.sweep_interval, shutdown_rx);

    let test_route = settings.listener.test_token.is_some();
    let app = listener::router(AppState::new(dispatcher, settings.listener));
    let tcp = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind))?;
    tracing::info!(addr = %settings.bind, test_route, "gmail relay listening");

    let served = axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    tracing::info!("gmail relay stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

/// Prints the body and headers of a signed synthetic notification as JSON.
fn sample(args: SampleArgs) -> anyhow::Result<()> {
    let mailbox = MailboxId::new(args.mailbox.as_str()).context("mailbox must not be blank")?;
    let message_id = args
        .message_id
        .as_deref()
        .map(|id| MessageId::new(id).context("message id must not be blank"))
        .transpose()?;
    let body =
        NotificationPayload::new(&mailbox, HistoryId::new(args.history_id), message_id.as_ref())
            .to_envelope();

    let signer = OriginAuthenticator::new(
        SecretString::from(args.webhook_secret),
        SignatureConfig::default(),
    );
    let timestamp = args
        .timestamped
        .then(|| Timestamp::now().as_datetime().timestamp());

    let mut headers = serde_json::Map::new();
    headers.insert(
        SIGNATURE_HEADER.into(),
        format!("sha256={}", signer.sign(timestamp, &body)).into(),
    );
    if let Some(ts) = timestamp {
        headers.insert(TIMESTAMP_HEADER.into(), ts.to_string().into());
    }
    let output = serde_json::json!({
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
