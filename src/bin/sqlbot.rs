use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use sqlbot::{
    AliasRegistry, CommandReceiver, Dispatcher, ExecutionRequest, QueryWorker,
    config::Settings,
    dispatch::queue,
    inbound::InboundRequest,
    message::build_catalog,
    metrics,
    mysql::MySqlConnector,
    publisher::{ResultPublisher, SlackPublisher, StdoutPublisher},
    registry::EnvSecrets,
};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sqlbot", version, about = "Run configured SQL queries by alias")]
struct Cli {
    /// Alias document path. Falls back to SQLBOT_ALIASES_PATH.
    #[arg(long)]
    aliases: Option<std::path::PathBuf>,

    /// Print results to stdout instead of uploading them to Slack
    #[arg(long)]
    print: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the alias catalog as a chat message body
    Aliases,

    /// Handle one inbound request body, then run the dispatched execution
    Receive {
        /// URL-encoded request body
        #[arg(long)]
        body: String,

        /// Envelope header as name=value (repeatable)
        #[arg(long = "header", action = ArgAction::Append)]
        headers: Vec<String>,
    },

    /// Execute one serialized execution request read from stdin
    Worker,

    /// Print counters in Prometheus text format
    Metrics,
}

fn init_tracing() {
    let level = std::env::var("LOGLEVEL").unwrap_or_else(|_| "info".into());
    let filter = EnvFilter::try_new(level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn publisher(settings: &Settings, print: bool) -> sqlbot::Result<Arc<dyn ResultPublisher>> {
    if print {
        Ok(Arc::new(StdoutPublisher))
    } else {
        Ok(Arc::new(SlackPublisher::from_settings(settings)?))
    }
}

#[tokio::main]
async fn main() -> sqlbot::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut settings = Settings::from_env()?;
    if let Some(path) = cli.aliases {
        settings.aliases_path = path;
    }
    if let Some(env) = &settings.env {
        tracing::debug!(env = %env, "environment");
    }

    match cli.command {
        Commands::Aliases => {
            let registry = AliasRegistry::load(&settings.aliases_path, Arc::new(EnvSecrets))?;
            let catalog = build_catalog(registry.entries(), None);
            println!("{}", serde_json::to_string_pretty(&catalog.to_json())?);
        }
        Commands::Receive { body, headers } => {
            let registry = AliasRegistry::load(&settings.aliases_path, Arc::new(EnvSecrets))?;
            let mut request = InboundRequest::new(body);
            for raw in headers {
                match raw.split_once('=') {
                    Some((name, value)) => request = request.with_header(name.trim(), value.trim()),
                    None => {
                        eprintln!("error: --header expects name=value, got `{raw}`");
                        std::process::exit(2);
                    }
                }
            }

            let (channel, rx) = queue(settings.queue_capacity);
            let worker = QueryWorker::new(
                Arc::new(MySqlConnector::default()),
                publisher(&settings, cli.print)?,
            );
            let worker_task = tokio::spawn(async move { worker.run(rx).await });

            let receiver = CommandReceiver::new(
                registry,
                Dispatcher::new(Arc::new(channel), settings.worker_handler.clone()),
            );
            let response = receiver.handle(&request).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "statusCode": response.status,
                    "body": response.body(),
                }))?
            );

            // Closing the receiver's queue lets the worker finish what was dispatched.
            drop(receiver);
            match worker_task.await {
                Ok(stats) if stats.publish_failures > 0 => {
                    eprintln!("warning: {} result(s) could not be published", stats.publish_failures);
                }
                Ok(_) => {}
                Err(err) => eprintln!("error: worker task failed: {err}"),
            }
        }
        Commands::Worker => {
            let mut payload = Vec::new();
            tokio::io::stdin().read_to_end(&mut payload).await?;
            let request = ExecutionRequest::from_payload(&payload)?;
            let worker = QueryWorker::new(
                Arc::new(MySqlConnector::default()),
                publisher(&settings, cli.print)?,
            );
            let execution = worker.handle(&request).await?;
            if let Some(failure) = execution.failure {
                eprintln!("execution failed: {}", failure.user_text());
            }
        }
        Commands::Metrics => {
            print!("{}", metrics::render_prometheus());
        }
    }

    Ok(())
}
