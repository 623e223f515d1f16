//! In-memory ledger store
//!
//! Behaves like the PostgreSQL store where it matters to orchestrators:
//! writes are buffered per session and become visible on commit, row locks
//! are real async mutexes held until commit or rollback, unique and foreign
//! key constraints produce the same classified errors. Ids come from
//! sequences, so rolled-back inserts leave gaps.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use mockable::DefaultClock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use super::models::{Account, Currency, Entry, Transfer, User, VerifyEmail, never};
use super::params::{
    CreateAccountParams, CreateUserParams, CreateVerifyEmailParams, ListAccountsParams,
    ListEntriesParams, ListTransfersParams, UpdateUserParams, UpdateVerifyEmailParams,
};
use super::{LedgerStore, LedgerTx, Queries, check_page};
use crate::SharedClock;
use crate::error::{BankError, Result};

/// Validity window of a verification code
const VERIFY_EMAIL_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    User(String),
    Email(String),
    Account(i64),
    AccountOwnerCurrency(String, Currency),
    VerifyEmail(i64),
}

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
}

impl Tables {
    fn merge(&mut self, other: Tables) {
        self.users.extend(other.users);
        self.accounts.extend(other.accounts);
        self.entries.extend(other.entries);
        self.transfers.extend(other.transfers);
        self.verify_emails.extend(other.verify_emails);
    }

    fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.accounts.is_empty()
            && self.entries.is_empty()
            && self.transfers.is_empty()
            && self.verify_emails.is_empty()
    }
}

struct Sequences {
    account: AtomicI64,
    entry: AtomicI64,
    transfer: AtomicI64,
    verify_email: AtomicI64,
}

impl Sequences {
    fn new() -> Self {
        Self {
            account: AtomicI64::new(1),
            entry: AtomicI64::new(1),
            transfer: AtomicI64::new(1),
            verify_email: AtomicI64::new(1),
        }
    }

    fn next(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::SeqCst)
    }
}

struct Shared {
    tables: Mutex<Tables>,
    locks: Mutex<HashMap<RowKey, Arc<RowMutex<()>>>>,
    sequences: Sequences,
    clock: SharedClock,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn row_mutex(&self, key: &RowKey) -> Arc<RowMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop lock entries nobody holds or waits on
    fn prune_locks(&self, keys: &[RowKey]) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in keys {
            if locks.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
                locks.remove(key);
            }
        }
    }
}

/// Thread-safe in-memory ledger store
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(DefaultClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                locks: Mutex::new(HashMap::new()),
                sequences: Sequences::new(),
                clock,
            }),
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.shared
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn session(&self, autocommit: bool) -> MemorySession {
        MemorySession {
            shared: self.shared.clone(),
            pending: Tables::default(),
            held: HashMap::new(),
            autocommit,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(self.session(false)))
    }

    async fn acquire(&self) -> Result<Box<dyn Queries>> {
        Ok(Box::new(self.session(true)))
    }
}

/// Session over the shared tables. Reads see committed rows overlaid with
/// this session's own pending writes.
pub struct MemorySession {
    shared: Arc<Shared>,
    pending: Tables,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    autocommit: bool,
}

impl MemorySession {
    async fn lock(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let mutex = self.shared.row_mutex(&key);
        let guard = mutex.lock_owned().await;
        self.held.insert(key, guard);
        // Give concurrent sessions a chance to interleave between locks
        tokio::task::yield_now().await;
    }

    fn apply(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            self.shared.tables().merge(pending);
        }
        self.release_locks();
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        self.shared.prune_locks(&keys);
    }

    /// End of one statement: autocommit sessions publish immediately
    fn end_statement(&mut self) {
        if self.autocommit {
            self.apply();
        }
    }

    fn now(&self) -> chrono::DateTime<Utc> {
        self.shared.clock.utc()
    }

    fn visible_user(&self, username: &str) -> Option<User> {
        self.pending
            .users
            .get(username)
            .cloned()
            .or_else(|| self.shared.tables().users.get(username).cloned())
    }

    fn visible_account(&self, id: i64) -> Option<Account> {
        self.pending
            .accounts
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().accounts.get(&id).cloned())
    }

    fn visible_verify_email(&self, id: i64) -> Option<VerifyEmail> {
        self.pending
            .verify_emails
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().verify_emails.get(&id).cloned())
    }

    fn visible_accounts(&self) -> BTreeMap<i64, Account> {
        let mut rows = self.shared.tables().accounts.clone();
        rows.extend(self.pending.accounts.clone());
        rows
    }

    fn visible_users(&self) -> BTreeMap<String, User> {
        let mut rows = self.shared.tables().users.clone();
        rows.extend(self.pending.users.clone());
        rows
    }

    fn email_taken_by_other(&self, email: &str, username: &str) -> bool {
        self.visible_users()
            .values()
            .any(|u| u.email == email && u.username != username)
    }

    fn require_account(&self, id: i64) -> Result<Account> {
        self.visible_account(id)
            .ok_or_else(|| BankError::not_found(format!("account {id}")))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release_locks();
    }
}

fn page<T: Clone>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    let skip = usize::try_from(offset).unwrap_or(usize::MAX);
    let take = usize::try_from(limit).unwrap_or(usize::MAX);
    rows.skip(skip).take(take).collect()
}

#[async_trait]
impl LedgerTx for MemorySession {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.apply();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.pending = Tables::default();
        self.release_locks();
        Ok(())
    }
}

#[async_trait]
impl Queries for MemorySession {
    async fn create_account(&mut self, params: &CreateAccountParams) -> Result<Account> {
        if self.visible_user(&params.owner).is_none() {
            return Err(BankError::not_found(format!(
                "accounts_owner_fkey: user {}",
                params.owner
            )));
        }
        let currency = params.currency;
        self.lock(RowKey::AccountOwnerCurrency(params.owner.clone(), currency))
            .await;
        let duplicate = self
            .visible_accounts()
            .values()
            .any(|a| a.owner == params.owner && a.currency == currency);
        if duplicate {
            self.end_statement();
            return Err(BankError::Conflict(format!(
                "accounts_owner_currency_key: ({}, {})",
                params.owner, currency
            )));
        }

        let account = Account {
            id: Sequences::next(&self.shared.sequences.account),
            owner: params.owner.clone(),
            balance: 0,
            currency,
            created_at: self.now(),
        };
        self.pending.accounts.insert(account.id, account.clone());
        self.end_statement();
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account> {
        self.require_account(id)
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account> {
        self.lock(RowKey::Account(id)).await;
        let result = self.require_account(id);
        self.end_statement();
        result
    }

    async fn list_accounts(&mut self, params: &ListAccountsParams) -> Result<Vec<Account>> {
        check_page(params.limit, params.offset)?;
        let rows = self.visible_accounts();
        Ok(page(
            rows.into_values().filter(|a| a.owner == params.owner),
            params.limit,
            params.offset,
        ))
    }

    async fn add_account_balance(&mut self, id: i64, amount: i64) -> Result<Account> {
        self.lock(RowKey::Account(id)).await;
        let mut account = match self.require_account(id) {
            Ok(account) => account,
            Err(e) => {
                self.end_statement();
                return Err(e);
            }
        };
        account.balance = match account.balance.checked_add(amount) {
            Some(balance) => balance,
            None => {
                self.end_statement();
                return Err(BankError::Storage(format!(
                    "bigint out of range: account {id}"
                )));
            }
        };
        self.pending.accounts.insert(id, account.clone());
        self.end_statement();
        Ok(account)
    }

    async fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry> {
        self.require_account(account_id)?;
        let entry = Entry {
            id: Sequences::next(&self.shared.sequences.entry),
            account_id,
            amount,
            created_at: self.now(),
        };
        self.pending.entries.insert(entry.id, entry.clone());
        self.end_statement();
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry> {
        self.pending
            .entries
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().entries.get(&id).cloned())
            .ok_or_else(|| BankError::not_found(format!("entry {id}")))
    }

    async fn list_entries(&mut self, params: &ListEntriesParams) -> Result<Vec<Entry>> {
        check_page(params.limit, params.offset)?;
        let mut rows = self.shared.tables().entries.clone();
        rows.extend(self.pending.entries.clone());
        Ok(page(
            rows.into_values().filter(|e| e.account_id == params.account_id),
            params.limit,
            params.offset,
        ))
    }

    async fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer> {
        self.require_account(from_account_id)?;
        self.require_account(to_account_id)?;
        if amount <= 0 {
            return Err(BankError::Storage(
                "transfers_amount_check: amount must be positive".to_string(),
            ));
        }
        let transfer = Transfer {
            id: Sequences::next(&self.shared.sequences.transfer),
            from_account_id,
            to_account_id,
            amount,
            created_at: self.now(),
        };
        self.pending.transfers.insert(transfer.id, transfer.clone());
        self.end_statement();
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer> {
        self.pending
            .transfers
            .get(&id)
            .cloned()
            .or_else(|| self.shared.tables().transfers.get(&id).cloned())
            .ok_or_else(|| BankError::not_found(format!("transfer {id}")))
    }

    async fn list_transfers(&mut self, params: &ListTransfersParams) -> Result<Vec<Transfer>> {
        check_page(params.limit, params.offset)?;
        let mut rows = self.shared.tables().transfers.clone();
        rows.extend(self.pending.transfers.clone());
        Ok(page(
            rows.into_values().filter(|t| {
                t.from_account_id == params.from_account_id
                    || t.to_account_id == params.to_account_id
            }),
            params.limit,
            params.offset,
        ))
    }

    async fn create_user(&mut self, params: &CreateUserParams) -> Result<User> {
        self.lock(RowKey::User(params.username.clone())).await;
        self.lock(RowKey::Email(params.email.clone())).await;

        if self.visible_user(&params.username).is_some() {
            self.end_statement();
            return Err(BankError::Conflict(format!(
                "users_pkey: username {} already exists",
                params.username
            )));
        }
        if self.email_taken_by_other(&params.email, &params.username) {
            self.end_statement();
            return Err(BankError::Conflict(format!(
                "users_email_key: email {} already exists",
                params.email
            )));
        }

        let user = User {
            username: params.username.clone(),
            hashed_password: params.hashed_password.clone(),
            full_name: params.full_name.clone(),
            email: params.email.clone(),
            is_email_verified: false,
            password_changed_at: never(),
            created_at: self.now(),
        };
        self.pending.users.insert(user.username.clone(), user.clone());
        self.end_statement();
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        self.visible_user(username)
            .ok_or_else(|| BankError::not_found(format!("user {username}")))
    }

    async fn update_user(&mut self, params: &UpdateUserParams) -> Result<User> {
        self.lock(RowKey::User(params.username.clone())).await;
        let Some(mut user) = self.visible_user(&params.username) else {
            self.end_statement();
            return Err(BankError::not_found(format!("user {}", params.username)));
        };

        if let Some(email) = &params.email {
            self.lock(RowKey::Email(email.clone())).await;
            if self.email_taken_by_other(email, &params.username) {
                self.end_statement();
                return Err(BankError::Conflict(format!(
                    "users_email_key: email {email} already exists"
                )));
            }
            user.email = email.clone();
        }
        if let Some(hashed_password) = &params.hashed_password {
            user.hashed_password = hashed_password.clone();
        }
        if let Some(changed_at) = params.password_changed_at {
            user.password_changed_at = changed_at;
        }
        if let Some(full_name) = &params.full_name {
            user.full_name = full_name.clone();
        }
        if let Some(verified) = params.is_email_verified {
            user.is_email_verified = verified;
        }

        self.pending.users.insert(user.username.clone(), user.clone());
        self.end_statement();
        Ok(user)
    }

    async fn create_verify_email(
        &mut self,
        params: &CreateVerifyEmailParams,
    ) -> Result<VerifyEmail> {
        if self.visible_user(&params.username).is_none() {
            return Err(BankError::not_found(format!(
                "verify_emails_username_fkey: user {}",
                params.username
            )));
        }
        let now = self.now();
        let record = VerifyEmail {
            id: Sequences::next(&self.shared.sequences.verify_email),
            username: params.username.clone(),
            email: params.email.clone(),
            secret_code: params.secret_code.clone(),
            is_used: false,
            created_at: now,
            expired_at: now + ChronoDuration::minutes(VERIFY_EMAIL_TTL_MINUTES),
        };
        self.pending.verify_emails.insert(record.id, record.clone());
        self.end_statement();
        Ok(record)
    }

    async fn update_verify_email(
        &mut self,
        params: &UpdateVerifyEmailParams,
    ) -> Result<VerifyEmail> {
        self.lock(RowKey::VerifyEmail(params.id)).await;
        let now = self.now();
        let record = self.visible_verify_email(params.id).filter(|r| {
            r.secret_code == params.secret_code && !r.is_used && !r.is_expired(now)
        });
        let Some(mut record) = record else {
            self.end_statement();
            return Err(BankError::not_found(format!("verify email {}", params.id)));
        };
        record.is_used = true;
        self.pending.verify_emails.insert(record.id, record.clone());
        self.end_statement();
        Ok(record)
    }
}
