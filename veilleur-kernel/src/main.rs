/**
 * VEILLEUR KERNEL - Point d'entrée principal
 *
 * RÔLE : Orchestration de tous les modules : config, store, scheduler,
 * maintenance, HTTP. Bootstrap du système complet.
 *
 * ARCHITECTURE : Registre SQLite + collecte SSH périodique + API REST.
 */
mod collector;
mod config;
mod history;
mod http;
mod maintenance;
mod models;
mod notify;
mod power;
mod probe;
mod registry;
mod scheduler;
mod ssh;
mod state;
mod store;
mod wol;

use crate::collector::SshCollector;
use crate::history::HistoryStore;
use crate::maintenance::MaintenanceService;
use crate::notify::Notifier;
use crate::power::PowerController;
use crate::probe::PingProbe;
use crate::registry::DeviceRegistry;
use crate::scheduler::{MetricsScheduler, SchedulerConfig};
use crate::store::SampleStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load_config().await;
    info!("veilleur kernel starting");

    // Store partagé : un seul pool SQLite pour le registre, les
    // échantillons et l'historique.
    let store = Arc::new(SampleStore::open(&cfg.database_path).await?);
    let registry = Arc::new(DeviceRegistry::new(store.pool().clone()));
    let history = Arc::new(HistoryStore::new(store.pool().clone()));

    // Alertes MQTT optionnelles (best-effort)
    let notifier = cfg.mqtt.as_ref().map(|mqtt| Arc::new(Notifier::start(mqtt)));
    if notifier.is_none() {
        info!("no mqtt configured, power alerts disabled");
    }

    // Scheduler de collecte
    let scheduler = MetricsScheduler::new(
        registry.clone(),
        store.clone(),
        history.clone(),
        Arc::new(SshCollector::default()),
        Arc::new(PingProbe::default()),
        notifier,
        SchedulerConfig::from(&cfg.collection),
    );
    scheduler.start();

    // Maintenance du store (checkpoint WAL + optimize + rétention)
    let maintenance =
        MaintenanceService::new(store.clone(), history.clone(), cfg.maintenance.clone());
    maintenance.start(cfg.maintenance.checkpoint_hours, cfg.maintenance.optimize_hours).await;

    // HTTP
    let app_state = http::AppState {
        registry,
        store,
        history,
        scheduler,
        maintenance,
        power: Arc::new(PowerController::default()),
        wol_conf: cfg.wol.clone(),
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!("kernel listening on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
