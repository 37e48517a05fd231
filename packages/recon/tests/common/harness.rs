//! Test harness with testcontainers for integration testing.
//!
//! Uses one shared Postgres container per test binary. The container and
//! migrations are initialized once on first test, then reused; tests stay
//! independent by working on freshly generated ids and addresses.

use anyhow::{Context, Result};
use recon_core::domains::schedules::SchedulerConfig;
use recon_core::kernel::jobs::{WorkerPool, WorkerPoolConfig};
use recon_core::kernel::test_dependencies::{
    MockDiscoveryProbe, MockScanProbe, TestNotificationSink,
};
use recon_core::kernel::{Orchestrator, PersistenceGateway, RetryPolicy, ServerKernel, TestDependencies};
use sqlx::PgPool;
use std::sync::Arc;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=recon_core=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    pub(super) async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Test harness that manages test infrastructure.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let orchestrator = ctx.orchestrator(test_worker_config());
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Database pool - use this for test fixtures.
    pub db_pool: PgPool,
    /// Mock probes and the recording sink shared by every kernel this
    /// harness builds.
    pub deps: TestDependencies,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
            .await
            .expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self {
            db_pool,
            deps: TestDependencies::new(),
        })
    }

    pub fn gateway(&self) -> PersistenceGateway {
        PersistenceGateway::new(self.db_pool.clone(), RetryPolicy::default())
    }

    pub fn kernel(&self) -> Arc<ServerKernel> {
        self.deps.clone().into_kernel(self.db_pool.clone())
    }

    /// A started worker pool behind an orchestrator.
    pub fn orchestrator(&self, config: WorkerPoolConfig) -> Arc<Orchestrator> {
        let kernel = self.kernel();
        let workers = WorkerPool::new(kernel.clone(), config);
        workers.start();
        Arc::new(Orchestrator::new(kernel, workers, SchedulerConfig::default()))
    }

    pub fn scan_probe(&self) -> &MockScanProbe {
        &self.deps.scan_probe
    }

    pub fn discovery_probe(&self) -> &MockDiscoveryProbe {
        &self.deps.discovery_probe
    }

    pub fn events(&self) -> &TestNotificationSink {
        &self.deps.notifications
    }
}
