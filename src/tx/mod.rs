//! Unit of Work
//!
//! [`exec_tx`] runs a body of ledger operations inside one transaction:
//! commit on success, rollback on any error, and the original error is
//! returned unchanged. The orchestrators built on top of it live in the
//! submodules.

pub mod transfer;
pub mod user;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{LedgerStore, LedgerTx};

pub use transfer::{TransferTxParams, TransferTxResult, transfer_tx};
pub use user::{
    AfterCreateHook, CreateUserTxParams, CreateUserTxResult, VerifyEmailTxParams,
    VerifyEmailTxResult, create_user_tx, verify_email_tx,
};

/// Run `body` in a single transaction.
///
/// The body borrows the transaction for its whole run. Anything it needs
/// from the caller must be moved in.
pub async fn exec_tx<T, F>(store: &dyn LedgerStore, body: F) -> Result<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut dyn LedgerTx) -> BoxFuture<'c, Result<T>> + Send,
{
    let mut tx = store.begin().await?;

    match body(tx.as_mut()).await {
        Ok(value) => {
            tx.commit().await?;
            debug!("unit of work committed");
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    error = %err,
                    rollback_error = %rollback_err,
                    "rollback failed after unit of work error"
                );
            }
            Err(err)
        }
    }
}
