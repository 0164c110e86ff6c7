use std::sync::Arc;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use uuid::Uuid;

use meetserver::config::AppConfig;
use meetserver::shared::state::AppState;
use meetserver::shared::utils;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Log panics that escape async boundaries instead of dying silently.
fn set_global_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Panic: {}", info);
        default_hook(info);
    }));
}

fn init_logging() {
    // Dependency crates are chatty at info; keep them quiet unless RUST_LOG
    // explicitly asks.
    let noise_filters = "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn,\
         tower=warn,tower_http=info,rustls=warn,tokio_tungstenite=warn,tungstenite=warn,\
         aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn,aws_runtime=warn";
    let rust_log = match std::env::var("RUST_LOG") {
        Ok(existing) if !existing.is_empty() => format!("{},{}", existing, noise_filters),
        _ => format!("info,{}", noise_filters),
    };
    env_logger::Builder::new().parse_filters(&rust_log).init();
}

fn print_usage() {
    eprintln!(
        "usage: meetserver <command>\n\
         \n\
         commands:\n\
         \x20 serve-api               run the HTTP API\n\
         \x20 run-dispatcher          run the scheduler/janitor\n\
         \x20 run-worker --bot-id=ID  run one bot worker\n\
         \x20 run-webhook-delivery    run the webhook delivery pool\n\
         \x20 migrate                 apply database migrations"
    );
}

fn parse_bot_id(args: &[String]) -> Option<Uuid> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--bot-id=") {
            return Uuid::parse_str(value).ok();
        }
        if arg == "--bot-id" {
            return iter.next().and_then(|v| Uuid::parse_str(v).ok());
        }
    }
    std::env::var("BOT_ID")
        .ok()
        .and_then(|v| Uuid::parse_str(&v).ok())
}

async fn build_state(config: AppConfig) -> anyhow::Result<Arc<AppState>> {
    let pool = utils::create_conn()?;
    let storage = meetserver::storage::build_storage(&config.drive).await?;
    Ok(AppState::new(pool, config, storage))
}

fn migrate() -> anyhow::Result<()> {
    let mut conn = utils::establish_pg_connection()?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migrations failed: {e}"))?;
    for migration in &applied {
        info!("Applied migration {}", migration);
    }
    info!("Database is up to date ({} applied)", applied.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    set_global_panic_hook();
    dotenvy::dotenv().ok();
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("");
    let config = AppConfig::from_env();

    match command {
        "serve-api" => {
            let state = build_state(config).await?;
            meetserver::api::serve(state).await
        }
        "run-dispatcher" => {
            let state = build_state(config).await?;
            meetserver::dispatcher::run_dispatcher(state).await
        }
        "run-worker" => {
            let bot_id = parse_bot_id(&args[2..]).ok_or_else(|| {
                anyhow::anyhow!("run-worker requires --bot-id=<uuid> (or BOT_ID in env)")
            })?;
            let state = build_state(config).await?;
            meetserver::controller::run_worker(state, bot_id).await
        }
        "run-webhook-delivery" => {
            let state = build_state(config).await?;
            let workers = std::env::var("WEBHOOK_DELIVERY_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4);
            meetserver::webhooks::delivery::run_delivery_workers(state, workers).await
        }
        "migrate" => tokio::task::spawn_blocking(migrate).await?,
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other:?}");
            print_usage();
            std::process::exit(2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_id_parses_both_flag_styles() {
        let id = Uuid::new_v4();
        let joined = vec![format!("--bot-id={id}")];
        let split = vec!["--bot-id".to_string(), id.to_string()];
        assert_eq!(parse_bot_id(&joined), Some(id));
        assert_eq!(parse_bot_id(&split), Some(id));
        assert_eq!(parse_bot_id(&["--bot-id=notauuid".to_string()]), None);
    }
}
