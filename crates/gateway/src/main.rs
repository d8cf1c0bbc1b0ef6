use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use od_conversations::ConversationStore;
use od_domain::config::{Config, ConfigSeverity};
use od_gateway::api;
use od_gateway::cli::{self, Cli, Command, ConfigCommand};
use od_gateway::runtime::events::EventBus;
use od_gateway::runtime::stop::StopRegistry;
use od_gateway::state::AppState;
use od_toolserver::ToolServerClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = cli::load_config(&args.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = cli::load_config(&args.config)?;
            if !cli::validate(&config, &args.config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = cli::load_config(&args.config)?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("opsdeck {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,od_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("opsdeck starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Conversation store ───────────────────────────────────────────
    let conversations = Arc::new(
        ConversationStore::new(&config.state.path).context("initializing conversation store")?,
    );
    tracing::info!(path = %config.state.path.display(), "conversation store ready");

    // ── Stop registry ────────────────────────────────────────────────
    let stops = Arc::new(
        StopRegistry::new(
            &config.state.path,
            Duration::from_secs(config.agent.stop_flag_ttl_seconds),
        )
        .context("initializing stop registry")?,
    );
    tracing::info!(
        ttl_seconds = config.agent.stop_flag_ttl_seconds,
        "stop registry ready"
    );

    // ── Event bus ────────────────────────────────────────────────────
    let events = Arc::new(EventBus::new(config.agent.integration_metadata_keys.clone()));
    tracing::info!(
        redacted_keys = config.agent.integration_metadata_keys.len(),
        "event bus ready"
    );

    // ── LLM provider ─────────────────────────────────────────────────
    let llm = od_providers::provider_from_config(&config.llm)
        .context("initializing LLM provider")?;
    tracing::info!(model = %config.llm.model, "LLM provider ready");

    // ── Tool server client ───────────────────────────────────────────
    let tools = Arc::new(
        ToolServerClient::new(&config.toolserver).context("initializing tool server client")?,
    );
    tracing::info!(url = %config.toolserver.base_url, "tool server client ready");

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = read_token_hash(&config.auth.api_token_env, "API");
    let admin_token_hash = read_token_hash(&config.auth.admin_token_env, "admin");

    let state = AppState {
        config: config.clone(),
        llm,
        tools,
        conversations,
        stops,
        events,
        api_token_hash,
        admin_token_hash,
    };

    // ── Router ───────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors_allowed_origins);
    let app = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state);

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "opsdeck listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn read_token_hash(env_var: &str, label: &str) -> Option<Vec<u8>> {
    match std::env::var(env_var) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var, "{label} bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(env_var, "{label} bearer-token auth DISABLED");
            None
        }
    }
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may carry a trailing `*` wildcard for the port segment
/// (e.g. `http://localhost:*`). A literal `"*"` allows all origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();
    for origin in allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            let origin_str = origin.to_str().unwrap_or("");
            // The remainder after the prefix must be digits only, so
            // "http://localhost:3000.evil.com" cannot slip through.
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
