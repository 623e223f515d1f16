//! Ledger invariants under concurrent transfers (in-memory store)

use std::time::Duration;

use simple_bank::store::{
    Account, CreateAccountParams, CreateUserParams, Currency, Entry, ListEntriesParams,
    ListTransfersParams, MemoryStore, Queries,
};
use simple_bank::tx::{TransferTxParams, transfer_tx};
use simple_bank::{BankError, LedgerStore};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Open an account funded by a single deposit entry, so balance == sum(entries)
async fn funded_account(store: &MemoryStore, owner: &str, deposit: i64) -> Account {
    let mut conn = store.acquire().await.unwrap();
    conn.create_user(&CreateUserParams {
        username: owner.to_string(),
        hashed_password: "hash".to_string(),
        full_name: format!("{owner} owner"),
        email: format!("{owner}@example.com"),
    })
    .await
    .unwrap();
    let account = conn
        .create_account(&CreateAccountParams {
            owner: owner.to_string(),
            currency: Currency::Usd,
        })
        .await
        .unwrap();
    conn.create_entry(account.id, deposit).await.unwrap();
    conn.add_account_balance(account.id, deposit).await.unwrap()
}

async fn entries(conn: &mut dyn Queries, account_id: i64) -> Vec<Entry> {
    conn.list_entries(&ListEntriesParams {
        account_id,
        limit: 1000,
        offset: 0,
    })
    .await
    .unwrap()
}

async fn assert_balance_matches_entries(store: &MemoryStore, account_id: i64) -> i64 {
    let mut conn = store.acquire().await.unwrap();
    let account = conn.get_account(account_id).await.unwrap();
    let sum: i64 = entries(conn.as_mut(), account_id)
        .await
        .iter()
        .map(|e| e.amount)
        .sum();
    assert_eq!(account.balance, sum, "balance drifted from entries");
    account.balance
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_direction_transfers() {
    let store = MemoryStore::new();
    let a = funded_account(&store, "same_a", 1_000).await;
    let b = funded_account(&store, "same_b", 1_000).await;

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                transfer_tx(
                    &store,
                    TransferTxParams {
                        from_account_id: a.id,
                        to_account_id: b.id,
                        amount: 10,
                    },
                )
                .await
            })
        })
        .collect();

    let results = tokio::time::timeout(TIMEOUT, futures::future::join_all(handles))
        .await
        .expect("transfers stalled");
    for result in results {
        result.unwrap().unwrap();
    }

    assert_eq!(assert_balance_matches_entries(&store, a.id).await, 950);
    assert_eq!(assert_balance_matches_entries(&store, b.id).await, 1_050);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alternating_directions_do_not_deadlock() {
    let store = MemoryStore::new();
    let a = funded_account(&store, "alt_a", 1_000).await;
    let b = funded_account(&store, "alt_b", 1_000).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let store = store.clone();
            let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
            tokio::spawn(async move {
                transfer_tx(
                    &store,
                    TransferTxParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount: 10,
                    },
                )
                .await
            })
        })
        .collect();

    let results = tokio::time::timeout(TIMEOUT, futures::future::join_all(handles))
        .await
        .expect("opposing transfers deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    assert_eq!(assert_balance_matches_entries(&store, a.id).await, 1_000);
    assert_eq!(assert_balance_matches_entries(&store, b.id).await, 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_transfer_has_balanced_entry_pair() {
    let store = MemoryStore::new();
    let a = funded_account(&store, "pair_a", 300).await;
    let b = funded_account(&store, "pair_b", 300).await;
    let c = funded_account(&store, "pair_c", 300).await;

    let legs = [(a.id, b.id, 40), (b.id, c.id, 25), (c.id, a.id, 70), (a.id, c.id, 5)];
    let handles: Vec<_> = legs
        .iter()
        .copied()
        .map(|(from, to, amount)| {
            let store = store.clone();
            tokio::spawn(async move {
                transfer_tx(
                    &store,
                    TransferTxParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount,
                    },
                )
                .await
            })
        })
        .collect();

    let results = tokio::time::timeout(TIMEOUT, futures::future::join_all(handles))
        .await
        .expect("transfers stalled");
    let results: Vec<_> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();

    for result in &results {
        assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
        assert_eq!(result.from_entry.account_id, result.transfer.from_account_id);
        assert_eq!(result.to_entry.account_id, result.transfer.to_account_id);
        assert_eq!(result.to_entry.amount, result.transfer.amount);
    }

    let total: i64 = {
        let mut sum = 0;
        for id in [a.id, b.id, c.id] {
            sum += assert_balance_matches_entries(&store, id).await;
        }
        sum
    };
    assert_eq!(total, 900, "money was created or destroyed");

    let mut conn = store.acquire().await.unwrap();
    let from_a = conn
        .list_transfers(&ListTransfersParams {
            from_account_id: a.id,
            to_account_id: a.id,
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(from_a.len(), 3);
}

#[tokio::test]
async fn test_failed_transfer_leaves_no_partial_rows() {
    let store = MemoryStore::new();
    let a = funded_account(&store, "fail_a", 100).await;

    let err = transfer_tx(
        &store,
        TransferTxParams {
            from_account_id: a.id,
            to_account_id: 9_999,
            amount: 10,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, BankError::NotFound(_)));

    let mut conn = store.acquire().await.unwrap();
    assert_eq!(entries(conn.as_mut(), a.id).await.len(), 1);
    assert_eq!(conn.get_account(a.id).await.unwrap().balance, 100);
}
