//! HTTP surface for reports, exports, alerts and on-demand checks.

pub mod handlers;
pub mod identity;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::access::AccessLogger;
use crate::config::HealthPolicy;
use crate::consent::ConsentTracker;
use crate::database::Database;
use crate::external::ClinicalDataStore;
use crate::health::{ComplianceChecks, HealthCheckScheduler};
use crate::isolation::IsolationMonitor;
use crate::ledger::LedgerStore;
use crate::report::ReportGenerator;

pub use identity::HeaderIdentity;

/// Every component, wired onto one database.
#[derive(Clone)]
pub struct AppState {
    pub ledger: LedgerStore,
    pub access: AccessLogger,
    pub monitor: IsolationMonitor,
    pub consent: ConsentTracker,
    pub scheduler: HealthCheckScheduler,
    pub reports: ReportGenerator,
}

impl AppState {
    pub fn new(database: Database, clinical: Arc<dyn ClinicalDataStore>, policy: HealthPolicy) -> Self {
        let ledger = LedgerStore::new(database);
        let monitor = IsolationMonitor::new(ledger.clone(), clinical.clone());
        let access = AccessLogger::new(ledger.clone(), Arc::new(monitor.clone()));
        let consent = ConsentTracker::new(ledger.clone());
        let scheduler = HealthCheckScheduler::new(ComplianceChecks::new(
            ledger.clone(),
            access.clone(),
            monitor.clone(),
            consent.clone(),
            clinical.clone(),
            policy,
        ));
        let reports = ReportGenerator::new(ledger.clone(), access.clone(), monitor.clone(), consent.clone(), clinical);

        Self {
            ledger,
            access,
            monitor,
            consent,
            scheduler,
            reports,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/tenants/:tenant/ledger/verify", get(handlers::verify_ledger))
        .route("/tenants/:tenant/report", get(handlers::certification_report))
        .route("/tenants/:tenant/patients/:patient/export", get(handlers::export_subject))
        .route("/tenants/:tenant/alerts", get(handlers::open_alerts))
        .route("/alerts/:id/resolve", post(handlers::resolve_alert))
        .route("/tenants/:tenant/health-checks/:check", post(handlers::run_health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).into_inner())
        .with_state(state)
}
