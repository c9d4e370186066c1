//! The process-wide server value: configuration, database pool, instance
//! map and the two shared registries. Constructed once at startup and
//! passed to every handler; no module-level mutable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, WrapErr};
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::exchanges::ExchangeManager;
use crate::instance::{load_instances, Instance};
use crate::longpoll::LongPollRegistry;

pub struct Server {
    pub cfg: Config,
    pub db: PgPool,
    pub instances: HashMap<String, Arc<Instance>>,
    pub exchanges: ExchangeManager,
    pub longpoll: LongPollRegistry,
}

impl Server {
    /// Connect to the database, run migrations, load instances and start
    /// exchange sessions for every configured exchange.
    pub async fn build(cfg: Config) -> Result<Arc<Self>> {
        let pool = db::create_pool(&cfg.database.url)
            .await
            .wrap_err("Failed to connect to database")?;
        info!("Database connected");

        db::run_migrations(&pool)
            .await
            .wrap_err("Failed to run database migrations")?;
        info!("Database migrations complete");

        let instances = load_instances(&cfg.instances)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .wrap_err("Failed to build HTTP client")?;
        let exchanges = ExchangeManager::new(http, &cfg.exchanges);

        Ok(Arc::new(Server {
            cfg,
            db: pool,
            instances,
            exchanges,
            longpoll: LongPollRegistry::new(),
        }))
    }

    /// Resolve an instance by id; `None` means the default instance
    pub fn instance(&self, id: Option<&str>) -> Option<&Arc<Instance>> {
        self.instances.get(id.unwrap_or("default"))
    }

    /// Stop both registries so in-flight requests can abort cleanly
    pub fn shutdown(&self) {
        self.longpoll.shutdown();
        self.exchanges.shutdown();
    }
}
