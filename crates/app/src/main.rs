mod certificates;
mod emails;
mod outline_sync;
mod problem;
mod router;
mod tasks;
mod telemetry;
mod tracker;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tracing::info;

use courseware_remote::{MailerClient, ModuleStoreClient};
use courseware_storage::Database;
use courseware_util::{load_env_file, AppConfig};

use crate::router::{Integrations, ServiceSettings};
use crate::tasks::{TaskQueue, TaskWorker};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_file = load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    if let Some(path) = env_file {
        info!(stage = "app", path = %path.display(), "loaded environment file");
    }

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "app", database_url = %config.database_url, "database ready");

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("courseware/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let integrations = Integrations {
        courses: Arc::new(ModuleStoreClient::new(
            config.modulestore_base_url.clone(),
            http.clone(),
        )),
        transport: Arc::new(MailerClient::new(config.mailer_base_url.clone(), http)),
    };

    let (tasks, receiver) = TaskQueue::channel();
    let state = router::AppState::new(
        metrics,
        tracker::Tracker::new(),
        database,
        tasks,
        integrations,
        ServiceSettings::from(&config),
    );

    TaskWorker::new(
        receiver,
        state.outline_sync().clone(),
        state.certificates().clone(),
    )
    .spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
