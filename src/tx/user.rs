//! User Lifecycle Orchestrators
//!
//! `create_user_tx` runs a caller-supplied hook inside the same transaction as
//! the insert: if the hook fails the user row is rolled back with it.
//! `verify_email_tx` consumes a verification code and flags the user as
//! verified together.

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::info;
use validator::Validate;

use super::exec_tx;
use crate::error::{BankError, Result};
use crate::store::{
    CreateUserParams, LedgerStore, UpdateUserParams, UpdateVerifyEmailParams, User, VerifyEmail,
};

/// Post-create hook. Participates in the transaction: an `Err` aborts it.
pub type AfterCreateHook = Box<dyn FnOnce(User) -> BoxFuture<'static, Result<()>> + Send>;

pub struct CreateUserTxParams {
    pub params: CreateUserParams,
    pub after_create: AfterCreateHook,
}

impl CreateUserTxParams {
    /// Params with a hook that does nothing
    pub fn without_hook(params: CreateUserParams) -> Self {
        Self {
            params,
            after_create: Box::new(|_user: User| async { Ok::<(), BankError>(()) }.boxed()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserTxResult {
    pub user: User,
}

pub async fn create_user_tx(
    store: &dyn LedgerStore,
    args: CreateUserTxParams,
) -> Result<CreateUserTxResult> {
    args.params.validate()?;

    let CreateUserTxParams {
        params,
        after_create,
    } = args;

    let user = exec_tx(store, move |tx| {
        async move {
            let user = tx.create_user(&params).await?;
            after_create(user.clone()).await?;
            Ok(user)
        }
        .boxed()
    })
    .await?;

    info!(username = %user.username, "user created");
    Ok(CreateUserTxResult { user })
}

#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct VerifyEmailTxParams {
    #[validate(range(min = 1))]
    pub email_id: i64,
    #[validate(length(min = 32, max = 128))]
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

pub async fn verify_email_tx(
    store: &dyn LedgerStore,
    params: VerifyEmailTxParams,
) -> Result<VerifyEmailTxResult> {
    params.validate()?;

    let result = exec_tx(store, move |tx| {
        async move {
            let verify_email = tx
                .update_verify_email(&UpdateVerifyEmailParams {
                    id: params.email_id,
                    secret_code: params.secret_code,
                })
                .await?;

            let user = tx
                .update_user(&UpdateUserParams {
                    is_email_verified: Some(true),
                    ..UpdateUserParams::new(verify_email.username.clone())
                })
                .await?;

            Ok(VerifyEmailTxResult { user, verify_email })
        }
        .boxed()
    })
    .await?;

    info!(
        username = %result.user.username,
        email_id = result.verify_email.id,
        "email verified"
    );
    Ok(result)
}
