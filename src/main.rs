use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use bulwark::{Attempt, Bulwark, BulwarkConfig, Identifier};

/// Rate limiting, deduplication and abuse tracking for public endpoints.
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "bulwark.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the configuration
    Validate,

    /// Evaluate one attempt against a policy
    Check {
        /// Policy name
        #[arg(long)]
        policy: String,

        /// Client identifier, usually an address
        #[arg(long, default_value = "")]
        identifier: String,

        /// Resource the session event refers to
        #[arg(long, requires = "session")]
        resource: Option<String>,

        /// Session that produced the event
        #[arg(long, requires = "resource")]
        session: Option<String>,
    },

    /// Show the abuse assessment for an identifier
    Score {
        /// Client identifier
        #[arg(long)]
        identifier: String,

        /// Lookback window in seconds (defaults to the configured lookback)
        #[arg(long)]
        lookback_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Bulwark");

    let mut config = BulwarkConfig::load(&cli.config)?;
    // A one-shot command exits right after deciding, so record inline.
    config.abuse.detached = false;

    match cli.command {
        Command::Validate => {
            let policies = config.validate()?;
            for (name, policy) in &policies {
                info!(
                    policy = %name,
                    limit = policy.limit(),
                    window_secs = policy.window().as_secs(),
                    dedup_ttl_secs = policy.dedup_ttl().map(|t| t.as_secs()),
                    failure_mode = %policy.failure_mode(),
                    "Policy valid"
                );
            }
            println!("{}", serde_json::to_string_pretty(&json!({
                "valid": true,
                "policies": policies.keys().collect::<Vec<_>>(),
            }))?);
        }
        Command::Check {
            policy,
            identifier,
            resource,
            session,
        } => {
            let bulwark = Bulwark::from_config(&config).await?;
            let mut attempt = Attempt::new(identifier.as_str());
            if let (Some(resource), Some(session)) = (resource, session) {
                attempt = attempt.for_session(resource, session);
            }

            let decision = bulwark.evaluate(&policy, &attempt).await?;
            let headers: serde_json::Map<String, serde_json::Value> = decision
                .headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.into()))
                .collect();

            println!("{}", serde_json::to_string_pretty(&json!({
                "backend": bulwark.backend_name(),
                "status": decision.status_code(),
                "headers": headers,
                "decision": decision,
            }))?);
        }
        Command::Score {
            identifier,
            lookback_secs,
        } => {
            let bulwark = Bulwark::from_config(&config).await?;
            let identifier = Identifier::new(&identifier);
            let assessment = bulwark.assess(identifier.as_str()).await?;

            let output = match lookback_secs {
                Some(secs) => {
                    let score = bulwark
                        .score(identifier.as_str(), Duration::from_secs(secs))
                        .await?;
                    json!({ "assessment": assessment, "lookback_secs": secs, "score": score })
                }
                None => json!({ "assessment": assessment }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Install the log subscriber. Logs go to stderr so command output stays parseable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
