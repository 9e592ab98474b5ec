//! Process-wide sharing of cluster state and connection pools.
//!
//! Nothing here is registered implicitly: callers construct the registries
//! and pass them around. Two brokers built through the same registries with
//! the same cluster name share one [`Cluster`] (and thus one metadata
//! fetch), and with the same (cluster, client id) share one
//! [`ConnectionPool`]. Entries are never evicted.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    broker::Broker,
    cluster::Cluster,
    config::{BrokerConf, ClusterConnectionConf},
    error::Result,
    pool::ConnectionPool,
};

/// Clusters keyed by cluster name.
#[derive(Debug, Default)]
pub struct MetadataCache {
    // An async mutex: creation performs the initial metadata fetch, and
    // concurrent constructors for one name must coalesce onto it.
    clusters: tokio::sync::Mutex<HashMap<String, Arc<Cluster>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cluster registered under `name`, connecting (and caching)
    /// it if this is the first caller.
    pub async fn get_or_create(
        &self,
        name: &str,
        bootstrap_addrs: &[String],
        conf: &ClusterConnectionConf,
    ) -> Result<Arc<Cluster>> {
        let mut clusters = self.clusters.lock().await;
        if let Some(cluster) = clusters.get(name) {
            debug!(cluster = name, "reusing cached cluster metadata");
            return Ok(Arc::clone(cluster));
        }
        let cluster = Cluster::connect(name, bootstrap_addrs, conf.clone()).await?;
        clusters.insert(name.to_string(), Arc::clone(&cluster));
        Ok(cluster)
    }
}

/// Connection pools keyed by (cluster name, client id).
#[derive(Debug, Default)]
pub struct ConnectionPoolCache {
    pools: Mutex<HashMap<(String, String), Arc<ConnectionPool>>>,
}

impl ConnectionPoolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        cluster_name: &str,
        client_id: &str,
        conf: &ClusterConnectionConf,
    ) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock();
        let key = (cluster_name.to_string(), client_id.to_string());
        if let Some(pool) = pools.get(&key) {
            debug!(cluster = cluster_name, client_id, "reusing cached connection pool");
            return Arc::clone(pool);
        }
        let pool = ConnectionPool::new(client_id, conf.clone());
        pools.insert(key, Arc::clone(&pool));
        pool
    }
}

/// Combined registries for building brokers that share identity.
#[derive(Debug, Default)]
pub struct ClientCache {
    metadata: MetadataCache,
    pools: ConnectionPoolCache,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn pools(&self) -> &ConnectionPoolCache {
        &self.pools
    }

    /// Builds a broker against `cluster_name`, sharing cluster state and the
    /// (cluster, client id) connection pool with every other broker built
    /// through this cache.
    pub async fn broker(
        &self,
        cluster_name: &str,
        bootstrap_addrs: &[String],
        conf: BrokerConf,
    ) -> Result<Broker> {
        let cluster = self
            .metadata
            .get_or_create(cluster_name, bootstrap_addrs, &conf.cluster_connection)
            .await?;
        let pool =
            self.pools
                .get_or_create(cluster_name, &conf.client_id, &conf.cluster_connection);
        cluster.attach_pool(&pool);
        Ok(Broker::from_parts(cluster, pool, conf))
    }
}
