//! A scripted in-process cluster.
//!
//! [`MockCluster`] plays both external collaborators of the router: the
//! routing lookup service (`RoutingSource`) and the remote command
//! dispatcher (`ShardService`). Each shard holds a scripted document
//! stream; error and hang injection points cover the failure paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{Document, Namespace, RemoteCursorId, ShardId};
use gantry_cursor::{
    RemoteError, RemoteResult, ShardCursorReply, ShardCursorRequest, ShardService,
};
use gantry_routing::{RoutingSource, RoutingTable};

/// Documents per reply batch when a shard has no explicit setting.
const REPLY_BATCH_DEFAULT: usize = 2;

/// Scripted behavior of one shard.
struct ShardBehavior {
    /// The shard's full (pre-sorted) result stream for any query.
    docs: Vec<Document>,
    /// Documents per reply batch.
    reply_batch: usize,
    /// Errors to fail successive opens with.
    fail_opens: VecDeque<RemoteError>,
    /// Errors to fail successive continuations with.
    fail_continuations: VecDeque<RemoteError>,
    /// Never answer opens; establishment must time out.
    hang_open: bool,
}

/// A live remote cursor on a mock shard.
struct OpenCursor {
    remaining: VecDeque<Document>,
    reply_batch: usize,
}

struct ClusterState {
    tables: HashMap<Namespace, RoutingTable>,
    shards: HashMap<ShardId, ShardBehavior>,
    open_cursors: HashMap<(ShardId, RemoteCursorId), OpenCursor>,
    next_remote_id: u64,
    open_log: Vec<ShardCursorRequest>,
    kill_log: Vec<ShardId>,
    load_count: u32,
}

/// The scripted cluster: routing source and shard dispatcher in one.
pub struct MockCluster {
    inner: Mutex<ClusterState>,
}

impl MockCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ClusterState {
                tables: HashMap::new(),
                shards: HashMap::new(),
                open_cursors: HashMap::new(),
                next_remote_id: 1,
                open_log: Vec::new(),
                kill_log: Vec::new(),
                load_count: 0,
            }),
        })
    }

    /// Installs the routing table served for a namespace.
    pub fn add_table(&self, namespace: Namespace, table: RoutingTable) {
        self.inner.lock().unwrap().tables.insert(namespace, table);
    }

    /// Installs a shard with its scripted result stream.
    pub fn add_shard(&self, shard: ShardId, docs: Vec<Document>) {
        self.inner.lock().unwrap().shards.insert(
            shard,
            ShardBehavior {
                docs,
                reply_batch: REPLY_BATCH_DEFAULT,
                fail_opens: VecDeque::new(),
                fail_continuations: VecDeque::new(),
                hang_open: false,
            },
        );
    }

    /// Queues an error for the shard's next cursor open.
    pub fn fail_next_open(&self, shard: ShardId, error: RemoteError) {
        self.inner
            .lock()
            .unwrap()
            .shards
            .get_mut(&shard)
            .expect("shard scripted")
            .fail_opens
            .push_back(error);
    }

    /// Queues an error for the shard's next continuation call.
    pub fn fail_next_continuation(&self, shard: ShardId, error: RemoteError) {
        self.inner
            .lock()
            .unwrap()
            .shards
            .get_mut(&shard)
            .expect("shard scripted")
            .fail_continuations
            .push_back(error);
    }

    /// Makes the shard stop answering opens entirely.
    pub fn hang_opens(&self, shard: ShardId) {
        self.inner
            .lock()
            .unwrap()
            .shards
            .get_mut(&shard)
            .expect("shard scripted")
            .hang_open = true;
    }

    /// Returns every open request the cluster has seen.
    #[must_use]
    pub fn open_requests(&self) -> Vec<ShardCursorRequest> {
        self.inner.lock().unwrap().open_log.clone()
    }

    /// Returns the number of remote cursors currently open.
    #[must_use]
    pub fn live_cursor_count(&self) -> usize {
        self.inner.lock().unwrap().open_cursors.len()
    }

    /// Returns the shards whose cursors were killed, in order.
    #[must_use]
    pub fn kills(&self) -> Vec<ShardId> {
        self.inner.lock().unwrap().kill_log.clone()
    }

    /// Returns how many times the routing source was consulted.
    #[must_use]
    pub fn load_count(&self) -> u32 {
        self.inner.lock().unwrap().load_count
    }
}

#[async_trait]
impl RoutingSource for MockCluster {
    async fn load(&self, namespace: &Namespace) -> Option<RoutingTable> {
        let mut state = self.inner.lock().unwrap();
        state.load_count += 1;
        state.tables.get(namespace).cloned()
    }
}

#[async_trait]
impl ShardService for MockCluster {
    async fn open_cursor(
        &self,
        shard: ShardId,
        request: ShardCursorRequest,
    ) -> RemoteResult<ShardCursorReply> {
        let hang = {
            let mut state = self.inner.lock().unwrap();
            let state = &mut *state;
            state.open_log.push(request.clone());

            let behavior = state.shards.get_mut(&shard).ok_or(RemoteError::Remote {
                shard,
                message: "shard not scripted".to_string(),
            })?;
            if let Some(error) = behavior.fail_opens.pop_front() {
                return Err(error);
            }
            if behavior.hang_open {
                true
            } else {
                // Execute the rewritten query the way a shard would: apply
                // skip, then cap the stream at the forwarded limit.
                let skip = request.query.skip.unwrap_or(0) as usize;
                let mut stream: VecDeque<Document> = behavior
                    .docs
                    .iter()
                    .skip(skip)
                    .take(request.query.limit.map_or(usize::MAX, |limit| limit as usize))
                    .cloned()
                    .collect();

                let reply_batch = behavior.reply_batch;
                let batch: Vec<Document> = stream.drain(..reply_batch.min(stream.len())).collect();

                let cursor = if stream.is_empty() {
                    None
                } else {
                    let id = RemoteCursorId::new(state.next_remote_id);
                    state.next_remote_id += 1;
                    state.open_cursors.insert(
                        (shard, id),
                        OpenCursor {
                            remaining: stream,
                            reply_batch,
                        },
                    );
                    Some(id)
                };
                return Ok(ShardCursorReply { cursor, batch });
            }
        };

        // A hung shard never answers; the caller's deadline decides.
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(RemoteError::Unreachable {
            shard,
            reason: "hung open".to_string(),
        })
    }

    async fn get_more(
        &self,
        shard: ShardId,
        cursor: RemoteCursorId,
        batch_size: Option<u32>,
    ) -> RemoteResult<ShardCursorReply> {
        let mut state = self.inner.lock().unwrap();

        if let Some(behavior) = state.shards.get_mut(&shard) {
            if let Some(error) = behavior.fail_continuations.pop_front() {
                return Err(error);
            }
        }

        let open = state
            .open_cursors
            .get_mut(&(shard, cursor))
            .ok_or(RemoteError::CursorNotFound { shard, cursor })?;

        let take = batch_size
            .map_or(open.reply_batch, |size| size as usize)
            .min(open.remaining.len());
        let batch: Vec<Document> = open.remaining.drain(..take).collect();

        if open.remaining.is_empty() {
            state.open_cursors.remove(&(shard, cursor));
            Ok(ShardCursorReply {
                cursor: None,
                batch,
            })
        } else {
            Ok(ShardCursorReply {
                cursor: Some(cursor),
                batch,
            })
        }
    }

    async fn kill_cursor(&self, shard: ShardId, cursor: RemoteCursorId) {
        let mut state = self.inner.lock().unwrap();
        state.open_cursors.remove(&(shard, cursor));
        state.kill_log.push(shard);
    }
}
