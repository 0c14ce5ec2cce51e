use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::{
    max_cluster_time,
    ClientSession,
    ClusterClock,
    ClusterTime,
    ServerSession,
    ServerSessionPool,
    SessionOptions,
    TransactionOptions,
    TransactionState,
};
use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Timestamp},
    concern::WriteConcern,
    error::ErrorKind,
    options::ServerAddress,
};

const TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn cluster_time(time: u32, increment: u32) -> ClusterTime {
    ClusterTime::new(Timestamp { time, increment }, doc! { "keyId": 1_i64 })
}

async fn session() -> Arc<ClientSession> {
    ClientSession::start(Arc::new(ServerSessionPool::new()), TIMEOUT, None).await
}

#[test]
fn cluster_time_ordering_ignores_signature() {
    let lhs = ClusterTime::new(Timestamp { time: 5, increment: 1 }, doc! { "a": 1 });
    let rhs = ClusterTime::new(Timestamp { time: 5, increment: 1 }, doc! { "b": 2 });
    assert_eq!(lhs, rhs);
    assert!(cluster_time(5, 2) > cluster_time(5, 1));
    assert!(cluster_time(6, 0) > cluster_time(5, 9));

    assert_eq!(max_cluster_time(None, None), None);
    assert_eq!(
        max_cluster_time(Some(cluster_time(1, 0)), None),
        Some(cluster_time(1, 0))
    );
    assert_eq!(
        max_cluster_time(Some(cluster_time(1, 0)), Some(cluster_time(2, 0))),
        Some(cluster_time(2, 0))
    );
}

#[test]
fn clock_only_advances() {
    let clock = ClusterClock::new();
    assert_eq!(clock.get(), None);

    clock.advance(&cluster_time(10, 1));
    assert_eq!(clock.get(), Some(cluster_time(10, 1)));

    clock.advance(&cluster_time(9, 5));
    assert_eq!(clock.get(), Some(cluster_time(10, 1)));

    clock.advance(&cluster_time(10, 2));
    assert_eq!(clock.get(), Some(cluster_time(10, 2)));
}

#[tokio::test]
async fn session_times_only_advance() {
    let session = session().await;

    session.advance_cluster_time(&cluster_time(3, 0));
    session.advance_cluster_time(&cluster_time(2, 0));
    assert_eq!(session.cluster_time(), Some(cluster_time(3, 0)));

    session.advance_operation_time(Timestamp { time: 7, increment: 0 });
    session.advance_operation_time(Timestamp { time: 6, increment: 9 });
    assert_eq!(
        session.operation_time(),
        Some(Timestamp { time: 7, increment: 0 })
    );
    session.advance_operation_time(Timestamp { time: 7, increment: 1 });
    assert_eq!(
        session.operation_time(),
        Some(Timestamp { time: 7, increment: 1 })
    );
}

#[tokio::test]
async fn concurrent_clock_advances_keep_maximum() {
    let clock = Arc::new(ClusterClock::new());
    let tasks: Vec<_> = (0..32u32)
        .map(|i| {
            let clock = clock.clone();
            tokio::spawn(async move { clock.advance(&cluster_time(i % 8, i)) })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(clock.get(), Some(cluster_time(7, 31)));
}

#[tokio::test]
async fn transaction_state_machine() {
    let session = session().await;
    assert_eq!(session.transaction_state(), TransactionState::None);
    assert!(session.commit_transaction().is_err());
    assert!(session.abort_transaction().is_err());

    session.start_transaction(None).unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Starting);
    assert_eq!(session.txn_number(), 1);
    assert!(matches!(
        *session.start_transaction(None).unwrap_err().kind,
        ErrorKind::Transaction { .. }
    ));

    session.apply_command();
    assert_eq!(session.transaction_state(), TransactionState::InProgress);
    session.commit_transaction().unwrap();
    session.commit_transaction().unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Committed);
    assert!(session.abort_transaction().is_err());

    session.start_transaction(None).unwrap();
    assert_eq!(session.txn_number(), 2);
    session.pin_server(ServerAddress::new("mongos", None));
    session.abort_transaction().unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Aborted);
    assert_eq!(session.pinned_server(), None);
    assert!(session.abort_transaction().is_err());
    assert!(session.commit_transaction().is_err());

    session.apply_command();
    assert_eq!(session.transaction_state(), TransactionState::None);
}

#[tokio::test]
async fn transaction_options_merge_with_defaults() {
    let defaults = TransactionOptions::builder()
        .write_concern(WriteConcern::majority())
        .build();
    let session = ClientSession::start(
        Arc::new(ServerSessionPool::new()),
        TIMEOUT,
        SessionOptions::builder()
            .default_transaction_options(defaults)
            .build(),
    )
    .await;

    session.start_transaction(None).unwrap();
    let options = session.transaction_options().unwrap();
    assert_eq!(options.write_concern, Some(WriteConcern::majority()));
    session.abort_transaction().unwrap();

    let unacknowledged = TransactionOptions::builder()
        .write_concern(WriteConcern::nodes(0))
        .build();
    assert!(matches!(
        *session.start_transaction(unacknowledged).unwrap_err().kind,
        ErrorKind::Transaction { .. }
    ));
    assert_eq!(session.transaction_state(), TransactionState::Aborted);
}

#[tokio::test]
async fn pinning_and_recovery_token() {
    let session = session().await;
    session.start_transaction(None).unwrap();
    session.pin_server(ServerAddress::new("a", None));
    session.set_recovery_token(doc! { "shard": "s1" });
    assert_eq!(session.pinned_server(), Some(ServerAddress::new("a", None)));
    assert!(session.pinned_criteria().is_some());
    assert_eq!(session.recovery_token(), Some(doc! { "shard": "s1" }));

    session.commit_transaction().unwrap();
    session.start_transaction(None).unwrap();
    assert_eq!(session.pinned_server(), None);
    assert_eq!(session.recovery_token(), None);

    session.pin_server(ServerAddress::new("b", None));
    session.unpin();
    assert_eq!(session.pinned_criteria().map(|_| ()), None);
}

#[tokio::test]
async fn causal_consistency_defaults() {
    let pool = Arc::new(ServerSessionPool::new());
    let explicit = ClientSession::start(pool.clone(), TIMEOUT, None).await;
    assert!(explicit.is_causally_consistent());
    assert!(!explicit.is_implicit());

    let disabled = ClientSession::start(
        pool.clone(),
        TIMEOUT,
        SessionOptions::builder().causal_consistency(false).build(),
    )
    .await;
    assert!(!disabled.is_causally_consistent());

    let implicit = ClientSession::start_implicit(pool, TIMEOUT).await;
    assert!(implicit.is_implicit());
    assert!(!implicit.is_causally_consistent());
}

#[tokio::test]
async fn end_session_returns_server_session() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = ClientSession::start(pool.clone(), TIMEOUT, None).await;
    let id = session.id().clone();
    assert!(matches!(
        id.get("id"),
        Some(Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            ..
        }))
    ));

    session.end_session().await;
    assert!(session.is_ended());
    assert!(pool.contains(&id).await);
    assert!(matches!(
        *session.increment_txn_number().unwrap_err().kind,
        ErrorKind::SessionEnded
    ));
    assert!(matches!(
        *session.start_transaction(None).unwrap_err().kind,
        ErrorKind::SessionEnded
    ));

    // Ending twice is a no-op.
    session.end_session().await;
    assert_eq!(pool.len().await, 1);

    let reused = ClientSession::start(pool.clone(), TIMEOUT, None).await;
    assert_eq!(reused.id(), &id);
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn dirty_sessions_are_discarded() {
    let pool = Arc::new(ServerSessionPool::new());
    let session = ClientSession::start(pool.clone(), TIMEOUT, None).await;
    session.mark_dirty();
    session.end_session().await;
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn pool_is_lifo_and_drops_expiring_sessions() {
    let pool = ServerSessionPool::new();
    let first = ServerSession::new();
    let second = ServerSession::new();
    let (first_id, second_id) = (first.id.clone(), second.id.clone());

    pool.check_in(first, TIMEOUT).await;
    pool.check_in(second, TIMEOUT).await;
    assert_eq!(pool.check_out(TIMEOUT).await.id, second_id);
    assert_eq!(pool.check_out(TIMEOUT).await.id, first_id);

    // A timeout under one minute makes every session about to expire.
    let short = Duration::from_secs(30);
    pool.check_in(ServerSession::new(), short).await;
    assert!(pool.is_empty().await);

    pool.check_in(ServerSession::new(), TIMEOUT).await;
    let fresh = pool.check_out(short).await;
    assert!(pool.is_empty().await);
    assert_eq!(fresh.txn_number, 0);
}
