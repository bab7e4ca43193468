use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use container_registry::auth::{issue_token, JwtTokenVerifier};
use container_registry::config::{DatabaseBackend, Settings};
use container_registry::registry::cleanup::spawn_cleanup_task;
use container_registry::registry::Registry;
use container_registry::{create_app, db, storage, AppState};

#[derive(Parser)]
#[command(name = "container-registry", version, about = "OCI Distribution registry server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Run one cleanup pass and exit
    Cleanup,
    /// Print a bearer token signed with JWT_SECRET
    Token {
        #[arg(long)]
        subject: String,
        /// Space separated `repository:<name>:<actions>` grants
        #[arg(long)]
        scope: Option<String>,
        #[arg(long)]
        admin: bool,
    },
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("container_registry=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load().context("Failed to load application settings")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Cleanup => {
            let registry = build_registry(&settings).await?;
            let retention = chrono::Duration::seconds(settings.registry.cleanup_retention_seconds as i64);
            let report = registry.run_cleanup(retention).await?;
            info!(removed = report.total(), "Cleanup finished");
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Token { subject, scope, admin } => {
            let token = issue_token(
                settings.auth.jwt_secret.expose_secret().as_bytes(),
                &subject,
                scope.as_deref(),
                admin,
                chrono::Duration::seconds(settings.auth.token_ttl_seconds as i64),
            )
            .context("Failed to sign token")?;
            println!("{token}");
            Ok(())
        }
        Command::Migrate => {
            if settings.database.backend != DatabaseBackend::Postgres {
                bail!("Migrations only apply to the postgres backend");
            }
            let pool = db::create_pool(&settings.database).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
    }
}

async fn build_registry(settings: &Settings) -> Result<Registry> {
    let store = db::open_store(&settings.database).await?;
    let storage = storage::from_settings(&settings.storage).context("Failed to initialize blob storage")?;
    Ok(Registry::new(store, storage, settings.registry_options()))
}

async fn serve(settings: Settings) -> Result<()> {
    let addr = settings.server.socket_addr()?;
    let registry = build_registry(&settings).await?;

    if settings.registry.cleanup_interval_seconds > 0 {
        spawn_cleanup_task(
            registry.clone(),
            Duration::from_secs(settings.registry.cleanup_interval_seconds),
            chrono::Duration::seconds(settings.registry.cleanup_retention_seconds as i64),
        );
    }

    let verifier = Arc::new(JwtTokenVerifier::from_settings(&settings.auth));
    let app = create_app(AppState::new(settings, registry, verifier));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Container registry listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
