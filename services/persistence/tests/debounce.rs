//! Debounced consolidation through the service, on the real clock
//!
//! Rapid mutations coalesce into one write after the quiet window; a
//! mutation made after that write is picked up by the next window.

use ledger_types::transaction::{Transaction, TransactionKind};
use persistence::{LedgerService, ServiceConfig};
use std::time::Duration;
use tempfile::TempDir;

const WINDOW: Duration = Duration::from_millis(100);

fn config(tmp: &TempDir) -> ServiceConfig {
    let mut config = ServiceConfig::new(tmp.path());
    config.persistence.debounce = WINDOW;
    config
}

fn tx(i: usize) -> Transaction {
    Transaction::new(format!("d{}", i), "2024-02-10", TransactionKind::Expense, 1.0, "COP").from_account("c1")
}

/// Wait until the parked save has been taken and its write has finished.
async fn settle(service: &LedgerService) {
    for _ in 0..100 {
        if !service.engine().has_pending() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!service.engine().has_pending());
    // takes the write lock, so any in-flight consolidation is done
    assert!(!service.engine().flush_pending().await.unwrap());
}

#[tokio::test]
async fn test_rapid_mutations_coalesce_into_one_write() {
    let tmp = TempDir::new().unwrap();
    let mut service = LedgerService::open(config(&tmp)).await.unwrap();

    for i in 0..5 {
        service.add_transaction(tx(i)).await.unwrap();
    }
    assert!(service.engine().has_pending());
    assert!(service.available_periods().await.unwrap().is_empty());

    tokio::time::sleep(WINDOW * 3).await;
    settle(&service).await;

    assert_eq!(service.available_periods().await.unwrap(), vec!["2024-02"]);
    assert_eq!(service.engine().load_shard("2024-02").await.unwrap().len(), 5);
    // everything in the WAL was folded in
    let wal = std::fs::metadata(service.engine().layout().wal_path()).unwrap();
    assert_eq!(wal.len(), 0);
}

#[tokio::test]
async fn test_later_mutation_triggers_another_window() {
    let tmp = TempDir::new().unwrap();
    let mut service = LedgerService::open(config(&tmp)).await.unwrap();

    service.add_transaction(tx(0)).await.unwrap();
    tokio::time::sleep(WINDOW * 3).await;
    settle(&service).await;

    service.add_transaction(tx(1)).await.unwrap();
    assert!(service.engine().has_pending());
    tokio::time::sleep(WINDOW * 3).await;
    settle(&service).await;

    assert_eq!(service.engine().load_shard("2024-02").await.unwrap().len(), 2);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_close_writes_a_save_still_inside_its_window() {
    let tmp = TempDir::new().unwrap();
    let mut long = config(&tmp);
    long.persistence.debounce = Duration::from_secs(3600);

    let mut service = LedgerService::open(long.clone()).await.unwrap();
    service.add_transaction(tx(0)).await.unwrap();
    service.set_exchange_rates([("USD".to_string(), 4000.0)].into()).unwrap();
    service.close().await.unwrap();

    // rates are not in the WAL, so only the final save can carry them
    let service = LedgerService::open(long).await.unwrap();
    assert_eq!(service.state().exchange_rates.get("USD"), Some(&4000.0));
    assert_eq!(service.transactions().len(), 1);
}
