//! PostgreSQL ledger store
//!
//! Runtime-checked `sqlx` queries. One [`PgSession`] type serves both the
//! autocommit path (a pooled connection) and the transactional path (a
//! `sqlx::Transaction`); both deref to `PgConnection`.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::ops::DerefMut;

use super::models::{Account, Entry, Transfer, User, VerifyEmail};
use super::params::{
    CreateAccountParams, CreateUserParams, CreateVerifyEmailParams, ListAccountsParams,
    ListEntriesParams, ListTransfersParams, UpdateUserParams, UpdateVerifyEmailParams,
};
use super::{LedgerStore, LedgerTx, Queries, check_page};
use crate::error::{BankError, Result};

/// Ledger store backed by a shared `PgPool`
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { conn: tx }))
    }

    async fn acquire(&self) -> Result<Box<dyn Queries>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession { conn }))
    }
}

/// Query session over anything that derefs to a `PgConnection`
pub struct PgSession<C> {
    conn: C,
}

#[async_trait]
impl LedgerTx for PgSession<Transaction<'static, Postgres>> {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.conn.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.conn.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl<C> Queries for PgSession<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (owner, balance, currency)
            VALUES ($1, 0, $2)
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(&params.owner)
        .bind(params.currency)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account> {
        sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("account {id}")))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account> {
        // NO KEY UPDATE does not conflict with the KEY SHARE locks taken by
        // entry/transfer foreign keys
        sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts WHERE id = $1
            FOR NO KEY UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("account {id}")))
    }

    async fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>> {
        check_page(params.limit, params.offset)?;
        let accounts = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, owner, balance, currency, created_at
            FROM accounts WHERE owner = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&params.owner)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(accounts)
    }

    async fn add_account_balance(&mut self, id: i64, amount: i64) -> Result<Account> {
        sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts SET balance = balance + $2
            WHERE id = $1
            RETURNING id, owner, balance, currency, created_at
            "#,
        )
        .bind(id)
        .bind(amount)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("account {id}")))
    }

    async fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry> {
        let entry = sqlx::query_as::<_, Entry>(
            r#"
            INSERT INTO entries (account_id, amount)
            VALUES ($1, $2)
            RETURNING id, account_id, amount, created_at
            "#,
        )
        .bind(account_id)
        .bind(amount)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry> {
        sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("entry {id}")))
    }

    async fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>> {
        check_page(params.limit, params.offset)?;
        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, account_id, amount, created_at
            FROM entries WHERE account_id = $1
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(params.account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(entries)
    }

    async fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer> {
        let transfer = sqlx::query_as::<_, Transfer>(
            r#"
            INSERT INTO transfers (from_account_id, to_account_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, from_account_id, to_account_id, amount, created_at
            "#,
        )
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(amount)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer> {
        sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("transfer {id}")))
    }

    async fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>> {
        check_page(params.limit, params.offset)?;
        let transfers = sqlx::query_as::<_, Transfer>(
            r#"
            SELECT id, from_account_id, to_account_id, amount, created_at
            FROM transfers
            WHERE from_account_id = $1 OR to_account_id = $2
            ORDER BY id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(transfers)
    }

    async fn create_user(&mut self, params: &CreateUserParams) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, hashed_password, full_name, email)
            VALUES ($1, $2, $3, $4)
            RETURNING username, hashed_password, full_name, email,
                      is_email_verified, password_changed_at, created_at
            "#,
        )
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT username, hashed_password, full_name, email,
                   is_email_verified, password_changed_at, created_at
            FROM users WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("user {username}")))
    }

    async fn update_user(&mut self, params: &UpdateUserParams) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET
                hashed_password     = COALESCE($1, hashed_password),
                password_changed_at = COALESCE($2, password_changed_at),
                full_name           = COALESCE($3, full_name),
                email               = COALESCE($4, email),
                is_email_verified   = COALESCE($5, is_email_verified)
            WHERE username = $6
            RETURNING username, hashed_password, full_name, email,
                      is_email_verified, password_changed_at, created_at
            "#,
        )
        .bind(&params.hashed_password)
        .bind(params.password_changed_at)
        .bind(&params.full_name)
        .bind(&params.email)
        .bind(params.is_email_verified)
        .bind(&params.username)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("user {}", params.username)))
    }

    async fn create_verify_email(
        &mut self,
        params: &CreateVerifyEmailParams,
    ) -> Result<VerifyEmail> {
        let record = sqlx::query_as::<_, VerifyEmail>(
            r#"
            INSERT INTO verify_emails (username, email, secret_code)
            VALUES ($1, $2, $3)
            RETURNING id, username, email, secret_code, is_used, created_at, expired_at
            "#,
        )
        .bind(&params.username)
        .bind(&params.email)
        .bind(&params.secret_code)
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(record)
    }

    async fn update_verify_email(
        &mut self,
        params: &UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail> {
        sqlx::query_as::<_, VerifyEmail>(
            r#"
            UPDATE verify_emails SET is_used = TRUE
            WHERE id = $1
              AND secret_code = $2
              AND is_used = FALSE
              AND expired_at > NOW()
            RETURNING id, username, email, secret_code, is_used, created_at, expired_at
            "#,
        )
        .bind(params.id)
        .bind(&params.secret_code)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| BankError::not_found(format!("verify email {}", params.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Currency;

    async fn test_store() -> PgStore {
        let pool = PgPool::connect(crate::TEST_DATABASE_URL)
            .await
            .expect("Failed to connect");
        crate::db::schema::init_schema(&pool).await.expect("schema");
        PgStore::new(pool)
    }

    fn unique_user() -> CreateUserParams {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        CreateUserParams {
            username: format!("u_{}", &tag[..12]),
            hashed_password: "hash".into(),
            full_name: "Test User".into(),
            email: format!("{}@example.com", &tag[..12]),
        }
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_duplicate_username_is_conflict() {
        let store = test_store().await;
        let mut conn = store.acquire().await.unwrap();
        let params = unique_user();
        conn.create_user(&params).await.unwrap();

        let err = conn.create_user(&params).await.unwrap_err();
        assert!(matches!(err, BankError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_account_for_unknown_owner_is_not_found() {
        let store = test_store().await;
        let mut conn = store.acquire().await.unwrap();
        let err = conn
            .create_account(&CreateAccountParams {
                owner: "nobody_at_all".into(),
                currency: Currency::Usd,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_rollback_discards_rows() {
        let store = test_store().await;
        let user = store.acquire().await.unwrap().create_user(&unique_user()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let account = tx
            .create_account(&CreateAccountParams {
                owner: user.username.clone(),
                currency: Currency::Eur,
            })
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let err = store
            .acquire()
            .await
            .unwrap()
            .get_account(account.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BankError::NotFound(_)));
    }

    async fn seeded_account(store: &PgStore, currency: Currency) -> Account {
        let mut conn = store.acquire().await.unwrap();
        let user = conn.create_user(&unique_user()).await.unwrap();
        conn.create_account(&CreateAccountParams {
            owner: user.username,
            currency,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_locking_read_blocks_writer_until_commit() {
        let store = test_store().await;
        let account = seeded_account(&store, Currency::Usd).await;

        let mut reader = store.begin().await.unwrap();
        reader.get_account_for_update(account.id).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut conn = store.acquire().await.unwrap();
                conn.add_account_balance(account.id, 25).await.unwrap().balance
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!writer.is_finished(), "writer must wait for the locking read");

        reader.add_account_balance(account.id, 10).await.unwrap();
        reader.commit().await.unwrap();
        assert_eq!(writer.await.unwrap(), 35);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_currency_decodes_to_enum() {
        let store = test_store().await;
        let account = seeded_account(&store, Currency::Thb).await;

        let fetched = store.acquire().await.unwrap().get_account(account.id).await.unwrap();
        assert_eq!(fetched.currency, Currency::Thb);
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL database"]
    async fn test_unsupported_stored_currency_fails_to_decode() {
        let store = test_store().await;
        let user = store.acquire().await.unwrap().create_user(&unique_user()).await.unwrap();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, 0, 'JPY') RETURNING id",
        )
        .bind(&user.username)
        .fetch_one(&store.pool)
        .await
        .unwrap();

        let err = store.acquire().await.unwrap().get_account(id).await.unwrap_err();
        assert!(matches!(err, BankError::Storage(_)), "got {err:?}");
    }
}
