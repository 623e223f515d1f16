//! PostgreSQL schema
//!
//! Every statement is idempotent so `init_schema` can run on each startup.

use sqlx::PgPool;

use crate::error::Result;

/// Create all tables and indexes if they do not exist yet
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing PostgreSQL schema...");

    for (name, ddl) in STATEMENTS {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            tracing::error!(statement = name, error = %e, "Schema statement failed");
            e
        })?;
    }

    tracing::info!("PostgreSQL schema initialized");
    Ok(())
}

const STATEMENTS: &[(&str, &str)] = &[
    ("users", CREATE_USERS_TABLE),
    ("accounts", CREATE_ACCOUNTS_TABLE),
    ("accounts_owner_currency", CREATE_ACCOUNTS_OWNER_CURRENCY_INDEX),
    ("entries", CREATE_ENTRIES_TABLE),
    ("entries_account", CREATE_ENTRIES_ACCOUNT_INDEX),
    ("transfers", CREATE_TRANSFERS_TABLE),
    ("transfers_from", CREATE_TRANSFERS_FROM_INDEX),
    ("transfers_to", CREATE_TRANSFERS_TO_INDEX),
    ("verify_emails", CREATE_VERIFY_EMAILS_TABLE),
    ("tasks", CREATE_TASKS_TABLE),
    ("tasks_ready", CREATE_TASKS_READY_INDEX),
    ("tasks_lease", CREATE_TASKS_LEASE_INDEX),
];

const CREATE_USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username            VARCHAR PRIMARY KEY,
    hashed_password     VARCHAR NOT NULL,
    full_name           VARCHAR NOT NULL,
    email               VARCHAR UNIQUE NOT NULL,
    is_email_verified   BOOLEAN NOT NULL DEFAULT FALSE,
    password_changed_at TIMESTAMPTZ NOT NULL DEFAULT '1970-01-01 00:00:00Z',
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id         BIGSERIAL PRIMARY KEY,
    owner      VARCHAR NOT NULL REFERENCES users (username),
    balance    BIGINT NOT NULL,
    currency   VARCHAR NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ACCOUNTS_OWNER_CURRENCY_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS accounts_owner_currency_key ON accounts (owner, currency)
"#;

const CREATE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id         BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts (id),
    amount     BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_ENTRIES_ACCOUNT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS entries_account_id_idx ON entries (account_id)";

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id              BIGSERIAL PRIMARY KEY,
    from_account_id BIGINT NOT NULL REFERENCES accounts (id),
    to_account_id   BIGINT NOT NULL REFERENCES accounts (id),
    amount          BIGINT NOT NULL CHECK (amount > 0),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_TRANSFERS_FROM_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS transfers_from_account_id_idx ON transfers (from_account_id)";

const CREATE_TRANSFERS_TO_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS transfers_to_account_id_idx ON transfers (to_account_id)";

const CREATE_VERIFY_EMAILS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS verify_emails (
    id          BIGSERIAL PRIMARY KEY,
    username    VARCHAR NOT NULL REFERENCES users (username),
    email       VARCHAR NOT NULL,
    secret_code VARCHAR NOT NULL,
    is_used     BOOLEAN NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    expired_at  TIMESTAMPTZ NOT NULL DEFAULT (NOW() + INTERVAL '15 minutes')
)
"#;

// state: 0 pending, 1 scheduled, 2 active, 3 retry, 4 archived, 5 completed
const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id               UUID PRIMARY KEY,
    task_type        VARCHAR NOT NULL,
    payload          BYTEA NOT NULL,
    queue            VARCHAR NOT NULL,
    state            SMALLINT NOT NULL,
    max_retry        INT NOT NULL,
    retried          INT NOT NULL DEFAULT 0,
    timeout_ms       BIGINT NOT NULL,
    process_at       TIMESTAMPTZ NOT NULL,
    lease_expires_at TIMESTAMPTZ,
    last_error       TEXT,
    last_failed_at   TIMESTAMPTZ,
    enqueued_at      TIMESTAMPTZ NOT NULL,
    completed_at     TIMESTAMPTZ
)
"#;

const CREATE_TASKS_READY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS tasks_ready_idx ON tasks (queue, state, process_at)";

const CREATE_TASKS_LEASE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS tasks_lease_idx ON tasks (state, lease_expires_at)";
