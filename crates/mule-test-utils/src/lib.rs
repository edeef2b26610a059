//! PostgreSQL fixtures for mule integration tests.
//!
//! Every test gets its own scratch database on one shared server. No
//! schema is provisioned here: the store lays its per-queue table groups
//! down in the `mule` schema when a test calls `create_queue`, which is
//! itself part of what the tests exercise.
//!
//! The shared server comes from `MULE_TEST_PG_URL` when set (CI jobs
//! provide one), otherwise a testcontainers instance is started once per
//! test binary.

use std::sync::Once;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

static TRACING: Once = Once::new();
static SCRATCH_COUNTER: AtomicU32 = AtomicU32::new(0);
static SERVER: OnceCell<PgServer> = OnceCell::const_new();

/// Install an env-filtered tracing subscriber once per test binary.
///
/// Controlled with `RUST_LOG`; output goes through the test writer so it
/// only shows for failing tests.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The PostgreSQL server all tests in this binary share.
enum PgServer {
    /// Supplied by the environment via `MULE_TEST_PG_URL`.
    External { url: String },
    /// Started here; the handle keeps the container alive until the
    /// binary exits.
    Dockerized {
        url: String,
        #[allow(dead_code)]
        container: ContainerAsync<Postgres>,
    },
}

impl PgServer {
    fn url(&self) -> &str {
        match self {
            Self::External { url } | Self::Dockerized { url, .. } => url,
        }
    }
}

async fn start_server() -> PgServer {
    if let Ok(url) = std::env::var("MULE_TEST_PG_URL") {
        return PgServer::External { url };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");

    PgServer::Dockerized {
        url: format!("postgresql://postgres:postgres@{host}:{port}"),
        container,
    }
}

/// Root URL of the shared server, with no database path.
pub async fn server_url() -> &'static str {
    SERVER.get_or_init(start_server).await.url()
}

/// One-connection pool to the server's `postgres` database, where
/// CREATE/DROP DATABASE must be issued from.
async fn admin_pool() -> PgPool {
    let url = format!("{}/postgres", server_url().await);
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&url)
        .await
        .expect("failed to reach the admin database")
}

/// Scratch names carry the process id, a coarse timestamp, and a
/// per-binary counter, so parallel binaries and leftovers from crashed
/// runs on an external server cannot collide.
fn scratch_name() -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!(
        "mule_scratch_{}_{stamp}_{}",
        std::process::id(),
        SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// A scratch database owned by one test.
///
/// Starts completely empty; the test's own `create_queue` calls build the
/// `mule` schema inside it. Call [`TestDb::teardown`] when done.
pub struct TestDb {
    pub pool: PgPool,
    pub name: String,
    pub url: String,
}

impl TestDb {
    /// Create an empty scratch database and connect a pool to it.
    pub async fn create() -> Self {
        let name = scratch_name();

        let admin = admin_pool().await;
        sqlx::query(&format!("CREATE DATABASE {name}"))
            .execute(&admin)
            .await
            .unwrap_or_else(|e| panic!("failed to create scratch database {name}: {e}"));
        admin.close().await;

        let url = format!("{}/{name}", server_url().await);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to scratch database {name}: {e}"));

        Self { pool, name, url }
    }

    /// A pool capped at one connection.
    ///
    /// Session-scoped state only sticks when every statement runs on the
    /// same connection; the store's `mule.now` clock override is the main
    /// customer.
    pub async fn single_connection(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&self.url)
            .await
            .unwrap_or_else(|e| panic!("failed to open single connection to {}: {e}", self.name))
    }

    /// Drop the scratch database.
    ///
    /// `WITH (FORCE)` disconnects any session the test left behind, so
    /// teardown succeeds even when extra pools are still open.
    pub async fn teardown(self) {
        self.pool.close().await;
        let admin = admin_pool().await;
        let _ = sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", self.name))
            .execute(&admin)
            .await;
        admin.close().await;
    }
}
