use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::{create_read_pref, secondary_ok};
use crate::{
    bson::{doc, Bson, Document, Timestamp},
    client::session::{ClientSession, ClusterClock, ClusterTime, ServerSessionPool},
    cmap::conn::wire::{Message, MessageFlags, Query, QueryFlags},
    concern::{ReadConcern, WriteConcern},
    error::ErrorKind,
    operation::Operation,
    options::{ReadPreference, ReadPreferenceOptions, TagSet},
    sdam::{SelectedServer, Server, ServerType, TopologyType},
    test::{MockDeployment, MockServer},
    TransactionOptions,
};

const TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn find_op() -> Operation {
    let deployment = Arc::new(MockDeployment::new(TopologyType::ReplicaSetWithPrimary, vec![]));
    Operation::new("db", deployment, |cmd, _| {
        cmd.insert("find", "coll");
        Ok(())
    })
}

fn selected(server: Arc<MockServer>, topology_type: TopologyType) -> SelectedServer {
    SelectedServer::new(server as Arc<dyn Server>, topology_type)
}

fn modern_primary() -> SelectedServer {
    selected(
        MockServer::modern("a", ServerType::RsPrimary),
        TopologyType::ReplicaSetWithPrimary,
    )
}

fn keys(document: &Document) -> Vec<&str> {
    document.keys().map(String::as_str).collect()
}

fn ts(time: u32) -> Timestamp {
    Timestamp { time, increment: 0 }
}

async fn session() -> Arc<ClientSession> {
    ClientSession::start(Arc::new(ServerSessionPool::new()), TIMEOUT, None).await
}

fn tagged_secondary_preferred() -> ReadPreference {
    let tags: TagSet = [("dc".to_string(), "ny".to_string())].into();
    ReadPreference::SecondaryPreferred {
        options: Some(ReadPreferenceOptions::builder().tag_sets(vec![tags]).build()),
    }
}

#[test]
fn read_preference_document_table() {
    let secondary_preferred = ReadPreference::SecondaryPreferred { options: None };
    let stale_secondary_preferred = secondary_preferred
        .clone()
        .with_max_staleness(Duration::from_secs(120))
        .unwrap();
    let nearest = ReadPreference::Nearest { options: None };
    let primary = ReadPreference::Primary;
    let primary_preferred = doc! { "mode": "primaryPreferred" };

    let cases: Vec<(Option<&ReadPreference>, ServerType, TopologyType, bool, Option<Document>)> = vec![
        (None, ServerType::Standalone, TopologyType::Single, false, Some(primary_preferred.clone())),
        (None, ServerType::Mongos, TopologyType::Single, false, None),
        (None, ServerType::RsPrimary, TopologyType::ReplicaSetWithPrimary, false, None),
        (Some(&primary), ServerType::Mongos, TopologyType::Sharded, false, None),
        (
            Some(&primary),
            ServerType::RsSecondary,
            TopologyType::Single,
            false,
            Some(primary_preferred.clone()),
        ),
        (
            Some(&primary),
            ServerType::RsPrimary,
            TopologyType::ReplicaSetWithPrimary,
            false,
            Some(doc! { "mode": "primary" }),
        ),
        (Some(&secondary_preferred), ServerType::Mongos, TopologyType::Sharded, true, None),
        (
            Some(&secondary_preferred),
            ServerType::Mongos,
            TopologyType::Sharded,
            false,
            Some(doc! { "mode": "secondaryPreferred" }),
        ),
        (
            Some(&secondary_preferred),
            ServerType::RsSecondary,
            TopologyType::ReplicaSetWithPrimary,
            true,
            Some(doc! { "mode": "secondaryPreferred" }),
        ),
        (
            Some(&stale_secondary_preferred),
            ServerType::Mongos,
            TopologyType::Sharded,
            true,
            Some(doc! { "mode": "secondaryPreferred", "maxStalenessSeconds": 120 }),
        ),
        (
            Some(&nearest),
            ServerType::Mongos,
            TopologyType::Sharded,
            true,
            Some(doc! { "mode": "nearest" }),
        ),
    ];

    for (read_pref, server_type, topology_type, is_op_query, expected) in cases {
        assert_eq!(
            create_read_pref(read_pref, server_type, topology_type, is_op_query).unwrap(),
            expected,
            "{read_pref:?} on {server_type} in {topology_type}, OP_QUERY: {is_op_query}"
        );
    }

    let tagged = tagged_secondary_preferred();
    assert_eq!(
        create_read_pref(Some(&tagged), ServerType::Mongos, TopologyType::Sharded, true).unwrap(),
        Some(doc! { "mode": "secondaryPreferred", "tags": [{ "dc": "ny" }] })
    );
}

#[test]
fn secondary_ok_flag() {
    let direct = selected(
        MockServer::legacy("a", ServerType::RsSecondary),
        TopologyType::Single,
    );
    assert_eq!(secondary_ok(None, &direct), QueryFlags::SECONDARY_OK);

    let mongos = selected(MockServer::legacy("m", ServerType::Mongos), TopologyType::Single);
    assert_eq!(secondary_ok(None, &mongos), QueryFlags::empty());
    assert_eq!(
        secondary_ok(Some(&ReadPreference::Primary), &mongos),
        QueryFlags::empty()
    );
    assert_eq!(
        secondary_ok(Some(&ReadPreference::Nearest { options: None }), &mongos),
        QueryFlags::SECONDARY_OK
    );
}

#[tokio::test]
async fn op_msg_fields_are_added_in_order() {
    let session = session().await;
    session.advance_operation_time(ts(40));
    session.advance_cluster_time(&ClusterTime::new(ts(50), doc! { "keyId": 1_i64 }));

    let clock = Arc::new(ClusterClock::new());
    clock.advance(&ClusterTime::new(ts(30), doc! {}));

    let mut op = find_op();
    op.read_concern = Some(ReadConcern::majority());
    op.write_concern = Some(WriteConcern::majority());
    op.read_preference = Some(ReadPreference::Nearest { options: None });
    op.clock = Some(clock);

    let encoded = op.encode(&modern_primary(), Some(&session), None).unwrap();
    assert_eq!(encoded.name, "find");
    assert!(!encoded.more_to_come);
    assert_eq!(
        keys(&encoded.command),
        vec![
            "find",
            "readConcern",
            "lsid",
            "writeConcern",
            "$clusterTime",
            "$db",
            "$readPreference"
        ]
    );
    assert_eq!(
        encoded.command.get_document("readConcern").unwrap(),
        &doc! { "level": "majority", "afterClusterTime": ts(40) }
    );
    assert_eq!(encoded.command.get_document("lsid").unwrap(), session.id());
    assert_eq!(
        encoded.command.get_document("writeConcern").unwrap(),
        &doc! { "w": "majority" }
    );
    assert_eq!(
        encoded
            .command
            .get_document("$clusterTime")
            .unwrap()
            .get_timestamp("clusterTime")
            .unwrap(),
        ts(50)
    );
    assert_eq!(encoded.command.get_str("$db").unwrap(), "db");
    assert_eq!(
        encoded.command.get_document("$readPreference").unwrap(),
        &doc! { "mode": "nearest" }
    );

    let message = Message::from_bytes(&encoded.bytes).unwrap();
    assert_eq!(message.request_id, encoded.request_id);
    assert_eq!(message.flags, MessageFlags::empty());
    assert_eq!(message.document, encoded.command);
}

#[tokio::test]
async fn clock_wins_when_ahead_of_session() {
    let session = session().await;
    session.advance_cluster_time(&ClusterTime::new(ts(5), doc! {}));
    let clock = Arc::new(ClusterClock::new());
    clock.advance(&ClusterTime::new(ts(9), doc! { "keyId": 2_i64 }));

    let mut op = find_op();
    op.clock = Some(clock);
    let encoded = op.encode(&modern_primary(), Some(&session), None).unwrap();
    assert_eq!(
        encoded.command.get_document("$clusterTime").unwrap(),
        &doc! { "clusterTime": ts(9), "signature": { "keyId": 2_i64 } }
    );
}

#[test]
fn primary_read_preference_is_not_sent_with_op_msg() {
    let mut op = find_op();
    op.read_preference = Some(ReadPreference::Primary);
    let encoded = op.encode(&modern_primary(), None, None).unwrap();
    assert_eq!(encoded.command, doc! { "find": "coll", "$db": "db" });

    // A direct connection to a non-mongos server asks for primaryPreferred.
    let direct = selected(
        MockServer::modern("a", ServerType::RsSecondary),
        TopologyType::Single,
    );
    let encoded = find_op().encode(&direct, None, None).unwrap();
    assert_eq!(
        encoded.command.get_document("$readPreference").unwrap(),
        &doc! { "mode": "primaryPreferred" }
    );
}

#[tokio::test]
async fn op_query_wraps_read_preference() {
    let legacy = selected(
        MockServer::legacy("a", ServerType::Standalone),
        TopologyType::Single,
    );
    let session = session().await;

    let mut op = find_op();
    op.read_concern = Some(ReadConcern::local());
    let encoded = op.encode(&legacy, Some(&session), None).unwrap();

    let query = Query::from_bytes(&encoded.bytes).unwrap();
    assert_eq!(query.request_id, encoded.request_id);
    assert_eq!(query.full_collection_name, "db.$cmd");
    assert_eq!(query.number_to_return, -1);
    assert_eq!(query.flags, QueryFlags::SECONDARY_OK);
    // No session fields, cluster time or afterClusterTime for servers that predate them.
    assert_eq!(
        query.query,
        doc! {
            "$query": { "find": "coll", "readConcern": { "level": "local" } },
            "$readPreference": { "mode": "primaryPreferred" },
        }
    );
    assert_eq!(encoded.command, query.query);

    let replica_set_member = selected(
        MockServer::legacy("b", ServerType::RsPrimary),
        TopologyType::ReplicaSetWithPrimary,
    );
    let encoded = find_op().encode(&replica_set_member, None, None).unwrap();
    let query = Query::from_bytes(&encoded.bytes).unwrap();
    assert_eq!(query.flags, QueryFlags::empty());
    assert_eq!(query.query, doc! { "find": "coll" });
}

#[test]
fn unacknowledged_writes_set_more_to_come() {
    let mut op = find_op();
    op.write_concern = Some(WriteConcern::nodes(0));
    let encoded = op.encode(&modern_primary(), None, None).unwrap();
    assert!(encoded.more_to_come);
    assert_eq!(
        Message::from_bytes(&encoded.bytes).unwrap().flags,
        MessageFlags::MORE_TO_COME
    );
    assert_eq!(
        encoded.command.get_document("writeConcern").unwrap(),
        &doc! { "w": 0 }
    );

    op.write_concern = Some(
        WriteConcern::builder()
            .w(crate::options::Acknowledgment::Nodes(0))
            .journal(true)
            .build(),
    );
    let error = op.encode(&modern_primary(), None, None).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[tokio::test]
async fn transaction_fields() {
    let session = session().await;
    session
        .start_transaction(
            TransactionOptions::builder()
                .read_concern(ReadConcern::snapshot())
                .build(),
        )
        .unwrap();
    session.set_recovery_token(doc! { "shard": 1 });

    let mut op = find_op();
    op.read_concern = Some(ReadConcern::majority());
    let encoded = op.encode(&modern_primary(), Some(&session), None).unwrap();
    let command = &encoded.command;
    assert_eq!(
        command.get_document("readConcern").unwrap(),
        &doc! { "level": "snapshot" }
    );
    assert_eq!(command.get_i64("txnNumber").unwrap(), 1);
    assert!(command.get_bool("startTransaction").unwrap());
    assert!(!command.get_bool("autocommit").unwrap());
    assert_eq!(
        command.get_document("recoveryToken").unwrap(),
        &doc! { "shard": 1 }
    );
    assert_eq!(session.transaction_state(), crate::TransactionState::InProgress);

    // Later commands of the transaction carry neither a read concern nor startTransaction.
    let encoded = op.encode(&modern_primary(), Some(&session), None).unwrap();
    assert_eq!(
        keys(&encoded.command),
        vec!["find", "lsid", "txnNumber", "autocommit", "recoveryToken", "$db"]
    );
}

#[tokio::test]
async fn causally_consistent_transaction_defaults_read_concern() {
    let session = session().await;
    session.advance_operation_time(ts(12));
    session.start_transaction(None).unwrap();

    let encoded = find_op()
        .encode(&modern_primary(), Some(&session), None)
        .unwrap();
    assert_eq!(
        encoded.command.get_document("readConcern").unwrap(),
        &doc! { "afterClusterTime": ts(12) }
    );
}

#[tokio::test]
async fn retry_txn_number_and_session_support() {
    let session = session().await;
    let encoded = find_op()
        .encode(&modern_primary(), Some(&session), Some(7))
        .unwrap();
    assert_eq!(encoded.command.get("txnNumber"), Some(&Bson::Int64(7)));

    // Servers that report no session timeout get no session fields.
    let no_sessions = selected(
        MockServer::new(
            crate::sdam::ServerDescription::builder()
                .address(crate::options::ServerAddress::new("a", None))
                .server_type(ServerType::RsPrimary)
                .wire_version(crate::sdam::WireVersionRange::new(0, 17))
                .build(),
        ),
        TopologyType::ReplicaSetWithPrimary,
    );
    let encoded = find_op()
        .encode(&no_sessions, Some(&session), Some(7))
        .unwrap();
    assert_eq!(encoded.command, doc! { "find": "coll", "$db": "db" });

    session.end_session().await;
    let error = find_op()
        .encode(&modern_primary(), Some(&session), None)
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::SessionEnded));
}

#[test]
fn empty_command_is_rejected() {
    let deployment = Arc::new(MockDeployment::new(TopologyType::Single, vec![]));
    let op = Operation::new("db", deployment, |_, _| Ok(()));
    let error = op.encode(&modern_primary(), None, None).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::InvalidArgument { .. }));
}

#[test]
fn tagged_secondary_preferred_is_sent_to_mongos() {
    let mongos = selected(MockServer::modern("m", ServerType::Mongos), TopologyType::Sharded);
    let mut op = find_op();
    op.read_preference = Some(tagged_secondary_preferred());
    let encoded = op.encode(&mongos, None, None).unwrap();
    assert_eq!(
        encoded.command.get_document("$readPreference").unwrap(),
        &doc! { "mode": "secondaryPreferred", "tags": [{ "dc": "ny" }] }
    );
}
