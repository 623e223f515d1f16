//! Ledger Store
//!
//! Owns the Account, Entry, Transfer, User and VerifyEmail records and exposes
//! single-row primitives through [`Queries`]. The same primitives run either on
//! an autocommit session ([`LedgerStore::acquire`]) or inside a transaction
//! ([`LedgerStore::begin`]) that the unit-of-work executor commits or rolls
//! back.
//!
//! # Locking
//!
//! `add_account_balance` and `get_account_for_update` take a row lock that is
//! held until the surrounding transaction ends. Callers that touch several
//! accounts must lock them in ascending id order.
//!
//! # Errors
//!
//! Every method returns a classified [`BankError`]. Backends convert their
//! native errors before returning.

pub mod memory;
pub mod models;
pub mod params;
pub mod postgres;

use async_trait::async_trait;

use crate::error::{BankError, Result};

pub use memory::MemoryStore;
pub use models::{Account, Currency, Entry, Transfer, User, VerifyEmail};
pub use params::{
    CreateAccountParams, CreateUserParams, CreateVerifyEmailParams, ListAccountsParams,
    ListEntriesParams, ListTransfersParams, UpdateUserParams, UpdateVerifyEmailParams,
};
pub use postgres::PgStore;

/// Single-row ledger primitives
#[async_trait]
pub trait Queries: Send {
    // === Accounts ===
    async fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account>;
    async fn get_account(&mut self, id: i64) -> Result<Account>;
    /// Read an account and hold its row lock until the transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account>;
    async fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>>;
    /// Add a signed delta to the balance under the row lock
    async fn add_account_balance(&mut self, id: i64, amount: i64) -> Result<Account>;

    // === Entries ===
    async fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry>;
    async fn get_entry(&mut self, id: i64) -> Result<Entry>;
    async fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>>;

    // === Transfers ===
    async fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer>;
    async fn get_transfer(&mut self, id: i64) -> Result<Transfer>;
    async fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>>;

    // === Users ===
    async fn create_user(&mut self, params: &CreateUserParams) -> Result<User>;
    async fn get_user(&mut self, username: &str) -> Result<User>;
    async fn update_user(&mut self, params: &UpdateUserParams) -> Result<User>;

    // === Email verification ===
    async fn create_verify_email(&mut self, params: &CreateVerifyEmailParams)
    -> Result<VerifyEmail>;
    /// Consume a matching, unused, unexpired code; NotFound otherwise
    async fn update_verify_email(&mut self, params: &UpdateVerifyEmailParams)
    -> Result<VerifyEmail>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait LedgerTx: Queries {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Process-wide store handle, shared by reference between components
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Check out an autocommit session, each call is its own statement
    async fn acquire(&self) -> Result<Box<dyn Queries>>;
}

pub(crate) fn check_page(limit: i64, offset: i64) -> Result<()> {
    if limit <= 0 {
        return Err(BankError::validation("limit must be positive"));
    }
    if offset < 0 {
        return Err(BankError::validation("offset must not be negative"));
    }
    Ok(())
}
