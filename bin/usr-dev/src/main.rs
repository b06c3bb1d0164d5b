//! Local development runner.
//!
//! Wires a store (in-memory by default, Postgres when --database-url is
//! given), the in-process bus with the logging subscriber, and the user
//! aggregate, then drives one pass through every operation so the outbox
//! flow can be watched in the logs.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use usr_aggregate::UserAggregate;
use usr_bus::{register_log_subscribers, LocalBus};
use usr_common::NewUser;
use usr_store::memory::MemoryStore;
use usr_store::postgres::PgUserStore;
use usr_store::UserStore;

/// User backend development runner
#[derive(Parser, Debug)]
#[command(name = "usr-dev")]
#[command(about = "Runs the user aggregate, store and bus in one process")]
struct Args {
    /// Postgres connection string; omit to use the in-memory store
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Maximum Postgres pool connections
    #[arg(long, env = "USR_PG_MAX_CONNECTIONS", default_value = "5")]
    max_connections: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let store: Arc<dyn UserStore> = match &args.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(args.max_connections)
                .connect(url)
                .await?;
            let store = PgUserStore::new(pool);
            store.init_schema().await?;
            info!("Postgres store initialized");
            Arc::new(store)
        }
        None => {
            info!("no database URL given, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let bus = Arc::new(LocalBus::new(store.clone()));
    register_log_subscribers(&bus);

    let aggregate = UserAggregate::new(store, bus);

    run_demo(&aggregate).await?;

    // Handlers run as detached tasks; give them a moment before exit.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

async fn run_demo(aggregate: &UserAggregate) -> Result<()> {
    let tag = uuid::Uuid::new_v4().simple().to_string();

    let user = aggregate
        .create(NewUser {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            nickname: format!("ada-{tag}"),
            password: "correcthorse".to_string(),
            email: format!("ada-{tag}@example.com"),
            country: "GB".to_string(),
        })
        .await?;
    info!(user_id = %user.id, nickname = %user.nickname, "created");

    let updated = aggregate.update(user.id, &format!("lady-{tag}")).await?;
    info!(user_id = %updated.id, nickname = %updated.nickname, "updated");

    let listed = aggregate.find(Some("GB"), 1, 10).await?;
    info!(count = listed.len(), "listed GB users");

    aggregate.delete(user.id).await?;
    info!(user_id = %user.id, "soft-deleted");

    let after = aggregate.find(Some("GB"), 1, 10).await?;
    info!(count = after.len(), "listed GB users after delete");

    Ok(())
}
