//! Transfer Orchestrator
//!
//! One transfer is one unit of work: the Transfer row, the debit and credit
//! entries, and both balance adjustments. Balances are always adjusted on the
//! account with the smaller id first, so two transfers between the same pair
//! of accounts lock rows in the same order whatever their direction.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

use super::exec_tx;
use crate::error::Result;
use crate::store::{Account, Entry, LedgerStore, LedgerTx, Transfer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_distinct_accounts"))]
pub struct TransferTxParams {
    #[validate(range(min = 1))]
    pub from_account_id: i64,
    #[validate(range(min = 1))]
    pub to_account_id: i64,
    #[validate(range(min = 1))]
    pub amount: i64,
}

fn validate_distinct_accounts(
    params: &TransferTxParams,
) -> std::result::Result<(), ValidationError> {
    if params.from_account_id == params.to_account_id {
        return Err(ValidationError::new("same_account"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Move `amount` from one account to another.
///
/// Balances may go negative; no sufficient-funds check is made here.
pub async fn transfer_tx(
    store: &dyn LedgerStore,
    params: TransferTxParams,
) -> Result<TransferTxResult> {
    params.validate()?;

    let result = exec_tx(store, move |tx| {
        async move {
            let TransferTxParams {
                from_account_id,
                to_account_id,
                amount,
            } = params;

            let transfer = tx
                .create_transfer(from_account_id, to_account_id, amount)
                .await?;
            let from_entry = tx.create_entry(from_account_id, -amount).await?;
            let to_entry = tx.create_entry(to_account_id, amount).await?;

            let (from_account, to_account) = if from_account_id < to_account_id {
                add_money(tx, from_account_id, -amount, to_account_id, amount).await?
            } else {
                let (to_account, from_account) =
                    add_money(tx, to_account_id, amount, from_account_id, -amount).await?;
                (from_account, to_account)
            };

            Ok(TransferTxResult {
                transfer,
                from_account,
                to_account,
                from_entry,
                to_entry,
            })
        }
        .boxed()
    })
    .await?;

    info!(
        transfer_id = result.transfer.id,
        from_account_id = params.from_account_id,
        to_account_id = params.to_account_id,
        amount = params.amount,
        "transfer committed"
    );
    Ok(result)
}

/// Adjust two balances in the given order. Callers pass the smaller id first.
async fn add_money(
    tx: &mut dyn LedgerTx,
    first_id: i64,
    first_amount: i64,
    second_id: i64,
    second_amount: i64,
) -> Result<(Account, Account)> {
    debug!(first_id, second_id, "adjusting balances");
    let first = tx.add_account_balance(first_id, first_amount).await?;
    let second = tx.add_account_balance(second_id, second_amount).await?;
    Ok((first, second))
}
