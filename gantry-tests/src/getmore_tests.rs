//! End-to-end continuation tests: pin discipline, identity validation,
//! drains, and stream invalidation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gantry_core::{
    ApiParameters, CursorId, Document, Limits, Namespace, OpContext, Principal, RoutingVersion,
    SessionId, ShardId, TxnNumber,
};
use gantry_cursor::{
    CursorRegistry, FindRequest, ReadPreference, RemoteError, ShardService, TailableMode,
};
use gantry_routing::{CatalogCache, QueryPredicate, RoutingSource, RoutingTable};
use gantry_router::{GetMoreRequest, QueryRouter, RouterError};

use crate::mock_shard::MockCluster;

fn ns() -> Namespace {
    Namespace::new("app", "orders")
}

fn doc(value: i64) -> Document {
    Document::new(Bytes::from(format!("{value:010}")))
}

fn values(batch: &[Document]) -> Vec<i64> {
    batch
        .iter()
        .map(|doc| {
            String::from_utf8(doc.payload().to_vec())
                .unwrap()
                .parse()
                .unwrap()
        })
        .collect()
}

fn router_with_limits(cluster: &Arc<MockCluster>, limits: Limits) -> QueryRouter {
    let catalog = Arc::new(CatalogCache::new(
        Arc::clone(cluster) as Arc<dyn RoutingSource>
    ));
    QueryRouter::new(
        catalog,
        Arc::clone(cluster) as Arc<dyn ShardService>,
        Arc::new(CursorRegistry::new()),
        limits,
    )
}

/// One shard holding five documents; queries with batch size 2 leave a
/// live cursor behind.
fn cluster_with_docs() -> Arc<MockCluster> {
    let cluster = MockCluster::new();
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[ShardId::new(1)], RoutingVersion::new(1)),
    );
    cluster.add_shard(
        ShardId::new(1),
        vec![doc(1), doc(2), doc(3), doc(4), doc(5)],
    );
    cluster
}

fn find_request() -> FindRequest {
    FindRequest::new(ns(), QueryPredicate::Unbounded).with_batch_size(2)
}

fn get_more(cursor_id: CursorId) -> GetMoreRequest {
    GetMoreRequest {
        cursor_id,
        namespace: ns(),
        batch_size: Some(2),
        max_time: None,
    }
}

/// Runs the query and returns (router, registered cursor id, first batch).
async fn open_cursor(
    cluster: &Arc<MockCluster>,
    ctx: &OpContext,
) -> (QueryRouter, CursorId, Vec<Document>) {
    let router = router_with_limits(cluster, Limits::new());
    let result = router
        .run_query(ctx, &find_request(), ReadPreference::Primary)
        .await
        .unwrap();
    assert!(!result.cursor_id.is_zero());
    (router, result.cursor_id, result.batch)
}

#[tokio::test]
async fn test_continuations_drain_and_exhaust() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, cursor_id, first) = open_cursor(&cluster, &ctx).await;
    assert_eq!(values(&first), vec![1, 2]);

    let second = router.run_get_more(&ctx, &get_more(cursor_id)).await.unwrap();
    assert_eq!(values(&second.batch), vec![3, 4]);
    assert_eq!(second.cursor_id, cursor_id);

    let third = router.run_get_more(&ctx, &get_more(cursor_id)).await.unwrap();
    assert_eq!(values(&third.batch), vec![5]);
    assert_eq!(third.cursor_id, CursorId::ZERO);
    assert_eq!(router.registry().len(), 0);
    assert_eq!(cluster.live_cursor_count(), 0);
}

#[tokio::test]
async fn test_session_validation_kinds() {
    let cluster = cluster_with_docs();
    let sessionless = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &sessionless).await;

    // Created without a session, continued in one.
    let in_session = OpContext::new().with_session(SessionId::new(1));
    let error = router
        .run_get_more(&in_session, &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::CursorNotCreatedInSession { .. }));

    // The failed continuation returned the cursor unpinned.
    assert!(router.registry().is_unpinned(cursor_id));

    // A matching continuation still works.
    assert!(router.run_get_more(&sessionless, &get_more(cursor_id)).await.is_ok());
}

#[tokio::test]
async fn test_session_bound_cursor_rejects_other_sessions() {
    let cluster = cluster_with_docs();
    let creator = OpContext::new().with_session(SessionId::new(1));
    let (router, cursor_id, _) = open_cursor(&cluster, &creator).await;

    // Continued without a session.
    let error = router
        .run_get_more(&OpContext::new(), &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::CursorCreatedInSession { .. }));

    // Continued in a different session.
    let other = OpContext::new().with_session(SessionId::new(2));
    let error = router
        .run_get_more(&other, &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::SessionMismatch { .. }));

    assert!(router.registry().is_unpinned(cursor_id));
    assert!(router.run_get_more(&creator, &get_more(cursor_id)).await.is_ok());
}

#[tokio::test]
async fn test_transaction_validation_kinds() {
    let cluster = cluster_with_docs();
    let creator = OpContext::new()
        .with_session(SessionId::new(1))
        .with_txn_number(TxnNumber::new(5));
    let (router, cursor_id, _) = open_cursor(&cluster, &creator).await;

    // Continued outside any transaction.
    let sessionful = OpContext::new().with_session(SessionId::new(1));
    let error = router
        .run_get_more(&sessionful, &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::CursorCreatedInTransaction { .. }));

    // Continued under a different transaction number.
    let other_txn = OpContext::new()
        .with_session(SessionId::new(1))
        .with_txn_number(TxnNumber::new(6));
    let error = router
        .run_get_more(&other_txn, &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::TxnNumberMismatch { .. }));

    // Transaction-bearing continuation of a transaction-less cursor.
    let cluster2 = cluster_with_docs();
    let sessionful2 = OpContext::new().with_session(SessionId::new(1));
    let (router2, cursor_id2, _) = open_cursor(&cluster2, &sessionful2).await;
    let error = router2
        .run_get_more(&creator, &get_more(cursor_id2))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        RouterError::CursorNotCreatedInTransaction { .. }
    ));
}

#[tokio::test]
async fn test_api_parameter_mismatch() {
    let cluster = cluster_with_docs();
    let creator = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &creator).await;

    let mut versioned = OpContext::new();
    versioned.api_parameters = ApiParameters {
        version: Some("1".to_string()),
        strict: true,
        deprecation_errors: false,
    };

    let error = router
        .run_get_more(&versioned, &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::ApiMismatch { .. }));
    assert!(router.registry().is_unpinned(cursor_id));
}

#[tokio::test]
async fn test_unauthorized_principal_is_rejected() {
    let cluster = cluster_with_docs();
    let alice = OpContext::new().with_principal(Principal::new("alice"));
    let (router, cursor_id, _) = open_cursor(&cluster, &alice).await;

    let bob = OpContext::new().with_principal(Principal::new("bob"));
    let error = router
        .run_get_more(&bob, &get_more(cursor_id))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::Unauthorized { .. }));

    assert!(router.registry().is_unpinned(cursor_id));
    assert!(router.run_get_more(&alice, &get_more(cursor_id)).await.is_ok());
}

#[tokio::test]
async fn test_unknown_cursor_id() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, _, _) = open_cursor(&cluster, &ctx).await;

    let error = router
        .run_get_more(&ctx, &get_more(CursorId::new(9999)))
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::CursorNotFound { .. }));
}

#[tokio::test]
async fn test_namespace_mismatch_reads_as_not_found() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &ctx).await;

    let mut request = get_more(cursor_id);
    request.namespace = Namespace::new("app", "users");

    let error = router.run_get_more(&ctx, &request).await.unwrap_err();
    assert!(matches!(error, RouterError::CursorNotFound { .. }));

    // The cursor survives and is still reachable under its namespace.
    assert!(router.registry().is_unpinned(cursor_id));
    assert!(router.run_get_more(&ctx, &get_more(cursor_id)).await.is_ok());
}

#[tokio::test]
async fn test_stream_invalidation_surfaces_resume_marker() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &ctx).await;

    cluster.fail_next_continuation(
        ShardId::new(1),
        RemoteError::StreamInvalidated {
            resume_marker: Bytes::from_static(b"resume-here"),
        },
    );

    let response = router.run_get_more(&ctx, &get_more(cursor_id)).await.unwrap();
    assert_eq!(response.cursor_id, CursorId::ZERO);
    assert_eq!(
        response.invalidation_resume_marker,
        Some(Bytes::from_static(b"resume-here"))
    );
    assert_eq!(router.registry().len(), 0);
}

#[tokio::test]
async fn test_stream_close_ends_cleanly_without_error() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &ctx).await;

    cluster.fail_next_continuation(ShardId::new(1), RemoteError::StreamClosed);

    let response = router.run_get_more(&ctx, &get_more(cursor_id)).await.unwrap();
    assert_eq!(response.cursor_id, CursorId::ZERO);
    assert!(response.invalidation_resume_marker.is_none());
    assert_eq!(router.registry().len(), 0);
}

#[tokio::test]
async fn test_max_time_rejected_on_ordinary_continuation() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &ctx).await;

    let mut request = get_more(cursor_id);
    request.max_time = Some(Duration::from_millis(50));

    let error = router.run_get_more(&ctx, &request).await.unwrap_err();
    assert!(matches!(error, RouterError::InvalidQuery { .. }));
    assert!(router.registry().is_unpinned(cursor_id));
}

#[tokio::test]
async fn test_max_time_accepted_on_await_data_continuation() {
    let cluster = MockCluster::new();
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[ShardId::new(1)], RoutingVersion::new(1)),
    );
    cluster.add_shard(ShardId::new(1), vec![doc(1), doc(2), doc(3)]);
    let router = router_with_limits(&cluster, Limits::new());

    let request = find_request().with_tailable(TailableMode::TailableAwaitData);
    let result = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();
    assert!(!result.cursor_id.is_zero());

    let mut continuation = get_more(result.cursor_id);
    continuation.max_time = Some(Duration::from_millis(50));

    let response = router
        .run_get_more(&OpContext::new(), &continuation)
        .await
        .unwrap();
    assert_eq!(values(&response.batch), vec![3]);
}

#[tokio::test]
async fn test_oversized_document_carries_over_without_loss() {
    let cluster = cluster_with_docs();
    // Documents are 10 bytes each; a 25-byte reply budget fits two.
    let mut limits = Limits::new();
    limits.max_reply_bytes = 25;
    let router = router_with_limits(&cluster, limits);
    let ctx = OpContext::new();

    let request = FindRequest::new(ns(), QueryPredicate::Unbounded);
    let result = router
        .run_query(&ctx, &request, ReadPreference::Primary)
        .await
        .unwrap();
    assert_eq!(values(&result.batch), vec![1, 2]);
    assert!(!result.cursor_id.is_zero());

    let mut continuation = get_more(result.cursor_id);
    continuation.batch_size = None;

    let second = router.run_get_more(&ctx, &continuation).await.unwrap();
    assert_eq!(values(&second.batch), vec![3, 4]);

    let third = router.run_get_more(&ctx, &continuation).await.unwrap();
    assert_eq!(values(&third.batch), vec![5]);
    assert_eq!(third.cursor_id, CursorId::ZERO);
}

#[tokio::test]
async fn test_kill_cursor_removes_entry_and_remotes() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, cursor_id, _) = open_cursor(&cluster, &ctx).await;
    assert_eq!(cluster.live_cursor_count(), 1);

    router.kill_cursor(&ctx, cursor_id).await.unwrap();

    assert_eq!(router.registry().len(), 0);
    assert_eq!(cluster.live_cursor_count(), 0);

    let error = router.kill_cursor(&ctx, cursor_id).await.unwrap_err();
    assert!(matches!(error, RouterError::CursorNotFound { .. }));
}

#[tokio::test]
async fn test_kill_requires_authorization() {
    let cluster = cluster_with_docs();
    let alice = OpContext::new().with_principal(Principal::new("alice"));
    let (router, cursor_id, _) = open_cursor(&cluster, &alice).await;

    let bob = OpContext::new().with_principal(Principal::new("bob"));
    let error = router.kill_cursor(&bob, cursor_id).await.unwrap_err();
    assert!(matches!(error, RouterError::Unauthorized { .. }));
    assert_eq!(router.registry().len(), 1);
}

#[tokio::test]
async fn test_idle_reaper_reclaims_mortal_cursors_only() {
    let cluster = cluster_with_docs();
    let ctx = OpContext::new();
    let (router, mortal_id, _) = open_cursor(&cluster, &ctx).await;

    // A second cursor exempted from idle reclamation.
    let mut immortal_request = find_request();
    immortal_request.no_cursor_timeout = true;
    let immortal = router
        .run_query(&ctx, &immortal_request, ReadPreference::Primary)
        .await
        .unwrap();
    assert!(!immortal.cursor_id.is_zero());
    assert_eq!(router.registry().len(), 2);

    let idle = Duration::from_micros(router.limits().cursor_timeout_us);
    let reaped = router.reap_idle_cursors(Instant::now() + idle + Duration::from_secs(1)).await;

    assert_eq!(reaped, 1);
    assert_eq!(router.registry().len(), 1);
    assert!(router.registry().is_unpinned(immortal.cursor_id));
    assert!(!router.registry().is_unpinned(mortal_id));
}
