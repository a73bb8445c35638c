use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use alertbridge_core::{RecipientResolver, RequestId};
use alertbridge_server::config::{self, Config};
use alertbridge_server::ingest::{self, IngestState};
use alertbridge_server::{
    Dispatcher, DispatcherConfig, HttpReviewSubmitter, OpsgenieClient, OpsgenieConfig,
    PluginDataRepository, SqliteRepository, SyncEngine,
};

#[derive(Parser)]
#[command(name = "alertbridge")]
#[command(version)]
#[command(about = "Mirrors access request reviews into on-call alerts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    Serve,
    /// Print stored plugin data as JSON
    Show {
        /// Only show this request
        request_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Show { request_id } => show(request_id).await,
    }
}

fn open_repository(state_dir: &Path) -> Result<SqliteRepository> {
    let db_path = state_dir.join("alertbridge.db");
    info!("Using state database: {}", db_path.display());
    SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")
}

async fn serve() -> Result<()> {
    info!("Starting alertbridge {}", alertbridge_server::get_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    let repository = Arc::new(open_repository(&config.state_dir)?);

    let mut opsgenie = OpsgenieConfig::new(&config.opsgenie_api_url, &config.opsgenie_api_key);
    opsgenie.priority = config.opsgenie_priority.clone();
    let gateway = Arc::new(OpsgenieClient::new(opsgenie).context("Failed to build Opsgenie client")?);

    let mut engine = SyncEngine::new(repository, gateway)
        .with_recipients(RecipientResolver::new(
            &config.notify_annotation,
            &config.responders_annotation,
        ))
        .with_default_responders(config.default_responders.clone());

    match &config.review_submit_url {
        Some(url) => {
            info!("Automatic approval enabled, submitting reviews to {}", url);
            let submitter = HttpReviewSubmitter::new(url.as_str(), config.webhook_secret.clone())
                .context("Failed to build review submitter")?;
            engine = engine.with_review_submitter(Arc::new(submitter));
        }
        None => info!("REVIEW_SUBMIT_URL not set, automatic approval disabled"),
    }

    let dispatcher = Dispatcher::new(
        Arc::new(engine),
        DispatcherConfig {
            max_concurrency: config.max_concurrency,
            handle_timeout: config.handle_timeout,
            max_attempts: config.max_attempts,
            ..DispatcherConfig::default()
        },
    );

    if config.webhook_secret.is_none() {
        info!("WEBHOOK_SECRET not set, accepting unsigned events");
    }

    let app = ingest::router(Arc::new(IngestState {
        dispatcher: Arc::new(dispatcher),
        webhook_secret: config.webhook_secret.clone(),
    }));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn show(request_id: Option<String>) -> Result<()> {
    let repository = open_repository(&config::state_dir_from_env())?;

    let output = match request_id {
        Some(id) => {
            let id = RequestId::from(id);
            let data = repository
                .get(&id)
                .await
                .with_context(|| format!("Failed to read plugin data for {}", id))?;
            serde_json::to_string_pretty(&serde_json::json!({ "request_id": id, "data": data }))?
        }
        None => {
            let all = repository
                .get_all()
                .await
                .context("Failed to read plugin data")?;
            let rows: Vec<_> = all
                .into_iter()
                .map(|(id, data)| serde_json::json!({ "request_id": id, "data": data }))
                .collect();
            serde_json::to_string_pretty(&rows)?
        }
    };

    println!("{}", output);
    Ok(())
}
