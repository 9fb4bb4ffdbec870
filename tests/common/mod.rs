//! Shared test infrastructure: a single Postgres container reused across
//! every integration test in this crate, following the teacher's
//! `SharedTestInfra` pattern (one container, migrations/schema applied
//! once, each test gets its own schema-qualified tables).

use anyhow::{Context, Result};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedTestInfra {
    options: PgConnectOptions,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;

        let options = PgConnectOptions::new()
            .host(&host.to_string())
            .port(port)
            .username("postgres")
            .password("postgres")
            .database("postgres");

        Ok(Self {
            options,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async { Self::init().await.expect("shared test infra") })
            .await
    }
}

/// Returns connect options for the shared container, plus a plain `PgPool`
/// for fixture setup/teardown (distinct from the single-connection
/// `DbClient` under test).
pub async fn connect_options() -> PgConnectOptions {
    SharedTestInfra::get().await.options.clone()
}

pub async fn fixture_pool() -> PgPool {
    let options = connect_options().await;
    PgPool::connect_with(options)
        .await
        .expect("connect fixture pool")
}

/// Drops and recreates the queue tables this worker depends on (spec
/// section 6: schema dependencies are external; this worker never creates
/// them). Each test calls this first so tests don't see each other's rows.
pub async fn reset_schema(pool: &PgPool) {
    sqlx::raw_sql(
        "
        DROP TABLE IF EXISTS work_queue, work_queue_action, event_queue CASCADE;

        CREATE TABLE event_queue (
            event_table_work_item integer NOT NULL,
            uid integer,
            recorded timestamptz NOT NULL,
            pk_value integer NOT NULL,
            op char(1) NOT NULL,
            action integer,
            transaction_label text,
            work_item_query text NOT NULL,
            execute_asynchronously text,
            old jsonb,
            new jsonb,
            session_values jsonb
        );

        CREATE TABLE work_queue_action (
            action integer PRIMARY KEY,
            query text,
            uri text,
            method text NOT NULL DEFAULT 'GET',
            use_ssl boolean NOT NULL DEFAULT false,
            static_parameters jsonb
        );

        CREATE TABLE work_queue (
            parameters jsonb,
            uid integer,
            recorded timestamptz NOT NULL,
            transaction_label text,
            action integer NOT NULL,
            execute_asynchronously text,
            session_values jsonb
        );
        ",
    )
    .execute(pool)
    .await
    .expect("reset schema");
}

/// Per-test context: a fresh fixture pool against the shared container,
/// with the queue schema reset before the test body runs. Mirrors the
/// teacher's `TestHarness` (shared containers, per-test pool).
pub struct QueueTestHarness {
    pub pool: PgPool,
    pub options: PgConnectOptions,
}

impl AsyncTestContext for QueueTestHarness {
    async fn setup() -> Self {
        let options = connect_options().await;
        let pool = PgPool::connect_with(options.clone())
            .await
            .expect("connect fixture pool");
        reset_schema(&pool).await;
        Self { pool, options }
    }

    async fn teardown(self) {
        self.pool.close().await;
    }
}
