//! End-to-end query tests: targeting, retry-on-stale, first batches, and
//! partial results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gantry_core::{
    CollectionUuid, CursorId, Document, Limits, Namespace, OpContext, SortDirection, SortKey,
    SortPattern, SortValue, RoutingVersion, ShardId, TxnContext,
};
use gantry_cursor::{CursorRegistry, FindRequest, ReadPreference, RemoteError, ShardService};
use gantry_routing::{CatalogCache, KeyRange, QueryPredicate, RoutingSource, RoutingTable};
use gantry_router::{QueryRouter, RouterError};

use crate::mock_shard::MockCluster;

fn ns() -> Namespace {
    Namespace::new("app", "orders")
}

fn doc(value: i64) -> Document {
    Document::with_sort_key(
        Bytes::from(value.to_string()),
        SortKey::single(SortValue::Int(value)),
    )
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

fn router_over(cluster: &Arc<MockCluster>) -> QueryRouter {
    router_with_limits(cluster, Limits::new())
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

fn ascending() -> SortPattern {
    SortPattern::new(vec![SortDirection::Ascending])
}

fn query() -> FindRequest {
    FindRequest::new(ns(), QueryPredicate::Unbounded)
}

/// Three shards with an interleaved, per-shard-sorted document spread.
fn three_shard_cluster() -> Arc<MockCluster> {
    let cluster = MockCluster::new();
    cluster.add_table(
        ns(),
        RoutingTable::uniform(
            &[ShardId::new(1), ShardId::new(2), ShardId::new(3)],
            RoutingVersion::new(1),
        ),
    );
    cluster.add_shard(ShardId::new(1), vec![doc(1), doc(4)]);
    cluster.add_shard(ShardId::new(2), vec![doc(2), doc(5)]);
    cluster.add_shard(ShardId::new(3), vec![doc(3), doc(6)]);
    cluster
}

#[tokio::test]
async fn test_unknown_namespace_returns_zero_cursor() {
    let cluster = MockCluster::new();
    let router = router_over(&cluster);

    let result = router
        .run_query(&OpContext::new(), &query(), ReadPreference::Primary)
        .await
        .unwrap();

    assert_eq!(result.cursor_id, CursorId::ZERO);
    assert!(result.batch.is_empty());
    assert!(!result.partial_results_returned);
}

#[tokio::test]
async fn test_unknown_namespace_with_pinned_identity_fails() {
    let cluster = MockCluster::new();
    let router = router_over(&cluster);

    let mut request = query();
    request.collection_uuid = Some(CollectionUuid::new(7));

    let error = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::CollectionUuidMismatch { .. }));
}

#[tokio::test]
async fn test_single_and_multi_shard_queries_agree() {
    // The same logical collection, once spread over three shards and once
    // held whole by a single shard.
    let multi = three_shard_cluster();
    let single = MockCluster::new();
    single.add_table(
        ns(),
        RoutingTable::uniform(&[ShardId::new(7)], RoutingVersion::new(1)),
    );
    single.add_shard(
        ShardId::new(7),
        vec![doc(1), doc(2), doc(3), doc(4), doc(5), doc(6)],
    );

    let request = query().with_sort(ascending()).with_skip(2).with_limit(3);

    let multi_result = router_over(&multi)
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();
    let single_result = router_over(&single)
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();

    assert_eq!(values(&multi_result.batch), vec![3, 4, 5]);
    assert_eq!(values(&multi_result.batch), values(&single_result.batch));
    assert_eq!(multi_result.cursor_id, CursorId::ZERO);
    assert_eq!(single_result.cursor_id, CursorId::ZERO);
}

#[tokio::test]
async fn test_multi_shard_skip_is_rewritten_into_the_limit() {
    let cluster = three_shard_cluster();
    let router = router_over(&cluster);

    let request = query().with_sort(ascending()).with_skip(5).with_limit(10);
    let result = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();

    // Each per-shard request carries limit = skip + limit and no skip.
    let opens = cluster.open_requests();
    assert_eq!(opens.len(), 3);
    for open in &opens {
        assert_eq!(open.query.skip, None);
        assert_eq!(open.query.limit, Some(15));
        assert!(!open.query.single_batch);
    }

    // The router applied skip and limit itself after the merge.
    assert_eq!(values(&result.batch), vec![6]);
}

#[tokio::test]
async fn test_single_shard_skip_and_limit_forwarded() {
    let cluster = MockCluster::new();
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[ShardId::new(1)], RoutingVersion::new(1)),
    );
    cluster.add_shard(ShardId::new(1), vec![doc(1), doc(2), doc(3), doc(4)]);
    let router = router_over(&cluster);

    let request = query().with_skip(1).with_limit(2);
    let result = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();

    let opens = cluster.open_requests();
    assert_eq!(opens.len(), 1);
    assert_eq!(opens[0].query.skip, Some(1));
    assert_eq!(opens[0].query.limit, Some(2));

    assert_eq!(values(&result.batch), vec![2, 3]);
}

#[tokio::test]
async fn test_stale_routing_is_retried_up_to_the_bound() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1), doc(2)]);
    for _ in 0..10 {
        cluster.fail_next_open(
            shard,
            RemoteError::StaleShardVersion {
                shard,
                wanted: RoutingVersion::new(2),
            },
        );
    }
    let router = router_over(&cluster);

    let error = router
        .run_query(&OpContext::new(), &query(), ReadPreference::Primary)
        .await
        .unwrap_err();

    // The tenth consecutive stale failure surfaces instead of retrying.
    match error {
        RouterError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 10);
            assert!(source.is_stale_routing());
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(cluster.open_requests().len(), 10);
    // Every retry resolved a fresh snapshot after the invalidation.
    assert_eq!(cluster.load_count(), 10);
}

#[tokio::test]
async fn test_stale_routing_recovers_within_the_bound() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1), doc(2)]);
    for _ in 0..9 {
        cluster.fail_next_open(
            shard,
            RemoteError::StaleShardVersion {
                shard,
                wanted: RoutingVersion::new(2),
            },
        );
    }
    let router = router_over(&cluster);

    let result = router
        .run_query(&OpContext::new(), &query(), ReadPreference::Primary)
        .await
        .unwrap();

    assert_eq!(values(&result.batch), vec![1, 2]);
    assert_eq!(cluster.open_requests().len(), 10);
}

#[tokio::test]
async fn test_stale_database_version_invalidates_and_recovers() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1)]);
    cluster.fail_next_open(
        shard,
        RemoteError::StaleDatabaseVersion {
            db: "app".to_string(),
            wanted: gantry_core::DatabaseVersion::new(4),
        },
    );
    let router = router_over(&cluster);

    let result = router
        .run_query(&OpContext::new(), &query(), ReadPreference::Primary)
        .await
        .unwrap();

    assert_eq!(values(&result.batch), vec![1]);
    assert_eq!(cluster.load_count(), 2);
}

#[tokio::test]
async fn test_fatal_remote_error_is_not_retried() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1)]);
    cluster.fail_next_open(
        shard,
        RemoteError::Remote {
            shard,
            message: "index build in progress".to_string(),
        },
    );
    let router = router_over(&cluster);

    let error = router
        .run_query(&OpContext::new(), &query(), ReadPreference::Primary)
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::Remote(_)));
    assert_eq!(cluster.open_requests().len(), 1);
}

#[tokio::test]
async fn test_transaction_retry_policy_can_forbid_stale_retries() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1)]);
    cluster.fail_next_open(
        shard,
        RemoteError::StaleShardVersion {
            shard,
            wanted: RoutingVersion::new(2),
        },
    );
    let router = router_over(&cluster);

    let mut ctx = OpContext::new();
    ctx.txn = Some(TxnContext {
        can_continue_on_stale_error: false,
    });

    let error = router
        .run_query(&ctx, &query(), ReadPreference::Primary)
        .await
        .unwrap_err();
    assert!(error.is_stale_routing());
    assert_eq!(cluster.open_requests().len(), 1);
}

#[tokio::test]
async fn test_partial_results_from_a_hung_shard() {
    let cluster = three_shard_cluster();
    cluster.hang_opens(ShardId::new(3));
    let router = router_over(&cluster);

    let request = query()
        .with_allow_partial_results()
        .with_max_time(Duration::from_millis(200));
    let ctx = OpContext::new().with_deadline(Some(Instant::now() + Duration::from_millis(200)));

    let result = router
        .run_query(&ctx, &request, ReadPreference::Primary)
        .await
        .unwrap();

    assert!(result.partial_results_returned);
    let mut got = values(&result.batch);
    got.sort_unstable();
    assert_eq!(got, vec![1, 2, 4, 5]);
    assert_eq!(result.cursor_id, CursorId::ZERO);
}

#[tokio::test]
async fn test_hung_shard_without_partial_results_times_out() {
    let cluster = three_shard_cluster();
    cluster.hang_opens(ShardId::new(3));
    let router = router_over(&cluster);

    let request = query().with_max_time(Duration::from_millis(100));
    let ctx = OpContext::new().with_deadline(Some(Instant::now() + Duration::from_millis(100)));

    let error = router
        .run_query(&ctx, &request, ReadPreference::Primary)
        .await
        .unwrap_err();
    assert_eq!(error, RouterError::ExceededTimeLimit);
}

#[tokio::test]
async fn test_cursor_registered_when_first_batch_does_not_drain() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1), doc(2), doc(3), doc(4), doc(5)]);
    let router = router_over(&cluster);

    let request = query().with_batch_size(2);
    let result = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();

    assert!(!result.cursor_id.is_zero());
    assert_eq!(values(&result.batch), vec![1, 2]);
    assert_eq!(router.registry().len(), 1);
    assert_eq!(cluster.live_cursor_count(), 1);
}

#[tokio::test]
async fn test_single_batch_closes_the_cursor() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1), doc(2), doc(3), doc(4), doc(5)]);
    let router = router_over(&cluster);

    let mut request = query().with_batch_size(2);
    request.single_batch = true;

    let result = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();

    assert_eq!(result.cursor_id, CursorId::ZERO);
    assert_eq!(values(&result.batch), vec![1, 2]);
    assert_eq!(router.registry().len(), 0);
    // The still-open remote cursor was killed, not leaked.
    assert_eq!(cluster.live_cursor_count(), 0);
    assert_eq!(cluster.kills(), vec![shard]);
}

#[tokio::test]
async fn test_projection_on_reserved_sort_key_field_rejected() {
    let cluster = three_shard_cluster();
    let router = router_over(&cluster);

    let mut request = query();
    request.projection = vec!["name".to_string(), "$sortKey".to_string()];

    let error = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::InvalidQuery { .. }));
    assert!(cluster.open_requests().is_empty());
}

#[tokio::test]
async fn test_skip_limit_overflow_rejected() {
    let cluster = three_shard_cluster();
    let router = router_over(&cluster);

    let request = query().with_skip(u64::MAX).with_limit(2);
    let error = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap_err();
    assert!(matches!(error, RouterError::SkipLimitOverflow { .. }));
}

#[tokio::test]
async fn test_identity_mismatch_probes_the_primary_shard() {
    let cluster = MockCluster::new();
    let primary = ShardId::new(2);
    let other = ShardId::new(3);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[primary, other], RoutingVersion::new(1)),
    );
    cluster.add_shard(primary, vec![doc(7)]);
    cluster.add_shard(other, vec![doc(8)]);
    cluster.fail_next_open(
        other,
        RemoteError::CollectionUuidMismatch {
            expected: CollectionUuid::new(1),
            actual_namespace: None,
        },
    );
    let router = router_over(&cluster);

    // Target only the non-primary shard: its half of the hash space.
    let mut request = query();
    request.predicate = QueryPredicate::ShardKeyRange(KeyRange::new(u32::MAX - 10, u32::MAX));

    let result = router
        .run_query(&OpContext::new(), &request, ReadPreference::Primary)
        .await
        .unwrap();

    let opens = cluster.open_requests();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0].shard, other);
    assert_eq!(opens[1].shard, primary);
    assert_eq!(values(&result.batch), vec![7]);
}

#[tokio::test]
async fn test_identity_mismatch_with_named_collection_is_fatal() {
    let cluster = MockCluster::new();
    let shard = ShardId::new(1);
    cluster.add_table(
        ns(),
        RoutingTable::uniform(&[shard], RoutingVersion::new(1)),
    );
    cluster.add_shard(shard, vec![doc(1)]);
    cluster.fail_next_open(
        shard,
        RemoteError::CollectionUuidMismatch {
            expected: CollectionUuid::new(1),
            actual_namespace: Some(Namespace::new("app", "orders_v2")),
        },
    );
    let router = router_over(&cluster);

    let error = router
        .run_query(&OpContext::new(), &query(), ReadPreference::Primary)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        RouterError::CollectionUuidMismatch {
            actual_namespace: Some(_),
            ..
        }
    ));
    assert_eq!(cluster.open_requests().len(), 1);
}

#[tokio::test]
async fn test_sampling_marks_exactly_one_shard() {
    let cluster = three_shard_cluster();
    let router = router_over(&cluster);

    let mut ctx = OpContext::new();
    ctx.query_sampling = true;

    router
        .run_query(&ctx, &query(), ReadPreference::Primary)
        .await
        .unwrap();

    let sampled = cluster
        .open_requests()
        .iter()
        .filter(|open| open.sample_query)
        .count();
    assert_eq!(sampled, 1);
}
