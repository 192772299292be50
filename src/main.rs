use std::sync::Arc;

use reengage::api::{self, ApiState};
use reengage::clock::SystemClock;
use reengage::config::EngineConfig;
use reengage::engine::Engine;
use reengage::llm::{LlmProvider, OpenAiConfig, OpenAiProvider};
use reengage::store::{LibSqlStore, Store};
use reengage::transport::{SmsTransport, TwilioTransport};

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        eprintln!("Error: {key} not set");
        std::process::exit(1);
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let twilio_sid = required_env("TWILIO_ACCOUNT_SID");
    let twilio_token = required_env("TWILIO_AUTH_TOKEN");
    let twilio_from = required_env("TWILIO_PHONE_NUMBER");
    let config = EngineConfig::from_env()?;

    let port: u16 = std::env::var("REENGAGE_PORT")
        .unwrap_or_else(|_| "8000".to_string())
        .parse()
        .unwrap_or(8000);

    let model =
        std::env::var("REENGAGE_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

    eprintln!("📱 Reengage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{port}/api/status");
    eprintln!("   Webhook: http://0.0.0.0:{port}/webhook/sms");
    eprintln!("   From number: {twilio_from}");

    // LLM is optional: the classifier's rules and the composer's
    // templates cover every mandatory path without it.
    let llm: Option<Arc<dyn LlmProvider>> = match std::env::var("OPENAI_API_KEY") {
        Ok(key) => {
            eprintln!("   Model: {model}");
            let llm_config = OpenAiConfig::new(secrecy::SecretString::from(key), model);
            Some(Arc::new(OpenAiProvider::new(llm_config)?))
        }
        Err(_) => {
            eprintln!("   Model: none (OPENAI_API_KEY not set, using templates and rules only)");
            None
        }
    };

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("REENGAGE_DB_PATH").unwrap_or_else(|_| "./data/reengage.db".to_string());

    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Transport ────────────────────────────────────────────────────────
    let transport: Arc<dyn SmsTransport> = Arc::new(TwilioTransport::new(
        twilio_sid,
        secrecy::SecretString::from(twilio_token),
        twilio_from,
    )?);

    // ── Engine ───────────────────────────────────────────────────────────
    eprintln!(
        "   Sweep: every {}s, up to {} sends\n",
        config.sweep_interval.as_secs(),
        config.max_sends_per_sweep
    );

    let engine = Arc::new(Engine::new(
        store,
        transport,
        llm,
        Arc::new(SystemClock),
        config,
    ));
    engine.start_scheduler();

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = api::routes(ApiState {
        engine: engine.clone(),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "HTTP server started");
    axum::serve(listener, app).await?;

    Ok(())
}
