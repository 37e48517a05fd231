// ServerKernel - core infrastructure with all dependencies
//
// The ServerKernel holds the database pool, the persistence gateway, and the
// collaborators behind traits so tests can swap in mocks.

use sqlx::PgPool;
use std::sync::Arc;

use super::persistence::PersistenceGateway;
use super::retry::RetryPolicy;
use super::{BaseDiscoveryProbe, BaseNotificationSink, BaseScanProbe};

/// ServerKernel holds all server dependencies
pub struct ServerKernel {
    pub db_pool: PgPool,
    pub gateway: PersistenceGateway,
    pub scan_probe: Arc<dyn BaseScanProbe>,
    pub discovery_probe: Arc<dyn BaseDiscoveryProbe>,
    /// Receives every job status and progress event
    pub notifications: Arc<dyn BaseNotificationSink>,
}

impl ServerKernel {
    /// Creates a new ServerKernel; the gateway shares `db_pool`.
    pub fn new(
        db_pool: PgPool,
        retry: RetryPolicy,
        scan_probe: Arc<dyn BaseScanProbe>,
        discovery_probe: Arc<dyn BaseDiscoveryProbe>,
        notifications: Arc<dyn BaseNotificationSink>,
    ) -> Self {
        Self {
            gateway: PersistenceGateway::new(db_pool.clone(), retry),
            db_pool,
            scan_probe,
            discovery_probe,
            notifications,
        }
    }
}
