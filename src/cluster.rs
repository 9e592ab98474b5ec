//! Cluster routing state: which broker leads which partition, and how that
//! view is refreshed.
//!
//! The cluster caches `topic/partition → leader node` and `node → endpoint`
//! maps built from metadata responses, stamps every successful refresh with
//! a strictly increasing epoch, and coalesces concurrent refreshes into a
//! single in-flight request whose result all waiters share.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use rand::prelude::*;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::ClusterConnectionConf,
    error::{BrokerError, Error, Result},
    pool::{ConnectionPool, Leased},
    wire::{MetadataRequest, MetadataResponse},
};

/// Result of an in-flight refresh, shared between the refresher and any
/// waiters that piled onto it.
type SharedRefreshResult = Result<(), Arc<Error>>;

#[derive(Default)]
struct RoutingState {
    /// Dialable broker addresses: the bootstrap list at first, re-seeded
    /// from every fresh metadata snapshot.
    addrs: Vec<String>,
    /// topic → partition → leader node id, `-1` for leaderless partitions.
    endpoints: HashMap<String, HashMap<i32, i32>>,
    /// node id → `host:port`.
    nodes: HashMap<i32, String>,
}

pub struct Cluster {
    name: String,
    conf: ClusterConnectionConf,
    epoch: AtomicI64,
    routing: Mutex<RoutingState>,
    /// `Some` while a refresh is in flight; waiters clone the receiver and
    /// inherit the refresher's result instead of issuing a second request.
    refresh: Mutex<Option<watch::Receiver<Option<SharedRefreshResult>>>>,
    /// Connection pools kept in sync with the current endpoint set. Always
    /// contains at least the cluster's own metadata pool.
    pools: Mutex<Vec<Arc<ConnectionPool>>>,
    metadata_pool: Arc<ConnectionPool>,
}

impl Cluster {
    /// Builds the cluster state without contacting anything; use
    /// [`Cluster::connect`] for a ready-to-route cluster.
    pub(crate) fn new(
        name: impl Into<String>,
        bootstrap_addrs: &[String],
        conf: ClusterConnectionConf,
    ) -> Result<Arc<Self>> {
        if bootstrap_addrs.is_empty() {
            return Err(Error::NoKnownBrokers);
        }
        let name = name.into();
        let metadata_pool = ConnectionPool::new(format!("{name}-metadata"), conf.clone());
        metadata_pool.initialize_addrs(bootstrap_addrs);

        Ok(Arc::new(Self {
            name,
            conf,
            epoch: AtomicI64::new(0),
            routing: Mutex::new(RoutingState {
                addrs: bootstrap_addrs.to_vec(),
                ..RoutingState::default()
            }),
            refresh: Mutex::new(None),
            pools: Mutex::new(vec![Arc::clone(&metadata_pool)]),
            metadata_pool,
        }))
    }

    /// Connects to the cluster: performs the initial metadata refresh
    /// against the bootstrap addresses.
    pub async fn connect(
        name: impl Into<String>,
        bootstrap_addrs: &[String],
        conf: ClusterConnectionConf,
    ) -> Result<Arc<Self>> {
        let cluster = Self::new(name, bootstrap_addrs, conf)?;
        cluster.refresh_metadata().await?;
        Ok(cluster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata epoch: increments exactly once per successful refresh.
    pub fn epoch(&self) -> i64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn current_addrs(&self) -> Vec<String> {
        self.routing.lock().addrs.clone()
    }

    /// Registers `pool` to be re-initialized with the endpoint set of every
    /// future refresh, and seeds it with the current one.
    pub fn attach_pool(&self, pool: &Arc<ConnectionPool>) {
        pool.initialize_addrs(&self.current_addrs());
        let mut pools = self.pools.lock();
        if !pools.iter().any(|p| Arc::ptr_eq(p, pool)) {
            pools.push(Arc::clone(pool));
        }
    }

    /// Refreshes the routing state from the cluster, coalescing with any
    /// refresh already in flight: overlapping callers observe at most one
    /// epoch increment and share one result.
    pub async fn refresh_metadata(&self) -> Result<()> {
        loop {
            let role = {
                let mut slot = self.refresh.lock();
                match slot.as_ref() {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(rx);
                        Role::Refresher(tx)
                    }
                }
            };

            match role {
                Role::Refresher(tx) => {
                    let result = self.refresh_once(&[]).await;
                    *self.refresh.lock() = None;
                    return match result {
                        Ok(()) => {
                            tx.send(Some(Ok(()))).ok();
                            Ok(())
                        }
                        Err(e) => {
                            let shared = Arc::new(e);
                            tx.send(Some(Err(Arc::clone(&shared)))).ok();
                            Err(Error::Refresh(shared))
                        }
                    };
                }
                Role::Waiter(mut rx) => {
                    debug!(cluster = %self.name, "waiting on in-flight metadata refresh");
                    let rx_for_compare = rx.clone();
                    let waited = tokio::time::timeout(
                        self.conf.metadata_refresh_timeout,
                        rx.wait_for(|result| result.is_some()),
                    )
                    .await;
                    match waited {
                        Err(_) => return Err(Error::RefreshTimeout),
                        Ok(Ok(result)) => {
                            return match result.as_ref().expect("refresh result present") {
                                Ok(()) => Ok(()),
                                Err(shared) => Err(Error::Refresh(Arc::clone(shared))),
                            };
                        }
                        Ok(Err(_)) => {
                            // The refresher was dropped without reporting;
                            // clear the stale slot and take over.
                            let mut slot = self.refresh.lock();
                            if slot
                                .as_ref()
                                .map(|r| r.same_channel(&rx_for_compare))
                                .unwrap_or(false)
                            {
                                *slot = None;
                            }
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Refreshes requesting specific topics, which lets a cluster configured
    /// for it auto-create them. Not coalesced: the topic set is part of the
    /// request.
    pub async fn refresh_with_topics(&self, topics: &[String]) -> Result<()> {
        self.refresh_once(topics).await
    }

    async fn refresh_once(&self, topics: &[String]) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.conf.metadata_refresh_timeout;
        match tokio::time::timeout_at(deadline, self.fetch_metadata(topics)).await {
            Ok(Ok(response)) => {
                self.apply_metadata(&response);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(cluster = %self.name, error = %e, "metadata refresh failed");
                Err(e)
            }
            Err(_) => {
                warn!(cluster = %self.name, "metadata refresh timed out, abandoning");
                Err(Error::RefreshTimeout)
            }
        }
    }

    /// Fetches a metadata snapshot over an idle pooled connection if one
    /// exists, otherwise by dialing the known addresses in random order.
    async fn fetch_metadata(&self, topics: &[String]) -> Result<MetadataResponse> {
        let request = MetadataRequest {
            topics: topics.to_vec(),
        };

        if let Some(conn) = self.metadata_pool.get_idle_connection() {
            let conn = Leased::new(&self.metadata_pool, conn);
            match conn.metadata(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(cluster = %self.name, error = %e, "idle metadata connection failed");
                    conn.close();
                }
            }
        }

        let mut addrs = self.current_addrs();
        // Different clients should not stampede one bootstrap broker.
        addrs.shuffle(&mut thread_rng());

        let mut last_err = Error::NoKnownBrokers;
        for addr in addrs {
            let conn = match self.metadata_pool.get_connection_by_addr(&addr).await {
                Ok(conn) => Leased::new(&self.metadata_pool, conn),
                Err(e) => {
                    debug!(cluster = %self.name, addr = %addr, error = %e, "cannot reach broker for metadata");
                    last_err = e;
                    continue;
                }
            };
            match conn.metadata(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(cluster = %self.name, addr = %addr, error = %e, "metadata request failed");
                    conn.close();
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Replaces the routing maps with the snapshot in `response`, advances
    /// the epoch and pushes the fresh endpoint set into every attached pool.
    pub(crate) fn apply_metadata(&self, response: &MetadataResponse) {
        let addrs = {
            let mut routing = self.routing.lock();

            routing.nodes = response
                .brokers
                .iter()
                .map(|b| (b.node_id, b.endpoint()))
                .collect();

            routing.endpoints.clear();
            for topic in &response.topics {
                if BrokerError::from_code(topic.error_code).is_some() {
                    continue;
                }
                // Leaders that do not resolve to a known node count as
                // leaderless; resolution will force a refresh for them.
                let partitions: HashMap<i32, i32> = topic
                    .partitions
                    .iter()
                    .map(|p| {
                        let leader = if p.leader >= 0 && routing.nodes.contains_key(&p.leader) {
                            p.leader
                        } else {
                            -1
                        };
                        (p.id, leader)
                    })
                    .collect();
                routing.endpoints.insert(topic.name.clone(), partitions);
            }

            let mut addrs: Vec<String> = routing.nodes.values().cloned().collect();
            addrs.sort();
            addrs.dedup();
            if addrs.is_empty() {
                // A snapshot without brokers would strand us with nothing to
                // dial; keep the previous address list.
                warn!(cluster = %self.name, "metadata response contains no brokers");
            } else {
                routing.addrs = addrs;
            }
            routing.addrs.clone()
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cluster = %self.name, epoch, addrs = ?addrs, "metadata refreshed");

        let pools: Vec<_> = self.pools.lock().clone();
        for pool in pools {
            pool.initialize_addrs(&addrs);
        }
    }

    pub fn cached_leader_endpoint(&self, topic: &str, partition: i32) -> Option<String> {
        let routing = self.routing.lock();
        let node = *routing.endpoints.get(topic)?.get(&partition)?;
        if node < 0 {
            return None;
        }
        routing.nodes.get(&node).cloned()
    }

    /// Endpoint of the leader for `(topic, partition)`. On a cache miss a
    /// single refresh is attempted before giving up with
    /// `UnknownTopicOrPartition`.
    pub async fn leader_endpoint(&self, topic: &str, partition: i32) -> Result<String> {
        if let Some(endpoint) = self.cached_leader_endpoint(topic, partition) {
            return Ok(endpoint);
        }
        debug!(cluster = %self.name, topic, partition, "leader unknown, refreshing metadata");
        self.refresh_metadata().await?;
        self.cached_leader_endpoint(topic, partition)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition.into())
    }

    /// Number of partitions the current snapshot holds for `topic`. A topic
    /// that is absent (or has no partitions) is indistinguishable from an
    /// unknown topic.
    pub fn partition_count(&self, topic: &str) -> Result<i32> {
        let routing = self.routing.lock();
        match routing.endpoints.get(topic) {
            Some(partitions) if !partitions.is_empty() => Ok(partitions.len() as i32),
            _ => Err(BrokerError::UnknownTopicOrPartition.into()),
        }
    }

    /// Drops every routing entry pointing at `endpoint` so the next
    /// resolution for the affected partitions goes through a refresh
    /// instead of re-targeting a stale leader.
    pub fn forget_endpoint(&self, endpoint: &str) {
        let mut routing = self.routing.lock();
        let forgotten: Vec<i32> = routing
            .nodes
            .iter()
            .filter(|(_, ep)| ep.as_str() == endpoint)
            .map(|(node, _)| *node)
            .collect();
        if forgotten.is_empty() {
            return;
        }
        debug!(cluster = %self.name, endpoint, nodes = ?forgotten, "forgetting endpoint");
        for node in &forgotten {
            routing.nodes.remove(node);
        }
        for partitions in routing.endpoints.values_mut() {
            for leader in partitions.values_mut() {
                if forgotten.contains(leader) {
                    *leader = -1;
                }
            }
        }
    }
}

enum Role {
    Refresher(watch::Sender<Option<SharedRefreshResult>>),
    Waiter(watch::Receiver<Option<SharedRefreshResult>>),
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("epoch", &self.epoch())
            .field("addrs", &self.current_addrs())
            .finish_non_exhaustive()
    }
}
