// The pool manager is a single-owner actor: one task owns every pool and
// the client->backend mapping, requests arrive on a bounded inbox and are
// serviced strictly in arrival order, synchronous answers travel back on
// per-request oneshot channels. No other task ever touches the pool state.

// Standard library imports
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// External crate imports
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

// Internal crate imports
use crate::config::{get_config, ClusterConfig, DatabaseConfig, SpannerConfig};
use crate::errors::Error;
use crate::keepalive::KeepAlive;
use crate::server::{Server, ServerProcessIdentity};

/// How often pooled sessions are checked against MaxConnLifetime.
pub const CONNECTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

const REQUEST_QUEUE_DEPTH: usize = 64;

type GetResponder = oneshot::Sender<Result<Server, Error>>;
type MappingResponder = oneshot::Sender<Result<Vec<ServerProcessIdentity>, Error>>;

/// The requests the actor understands.
pub enum PoolRequest {
    Get {
        database: String,
        cluster: String,
        client_pid: i32,
        responder: GetResponder,
    },
    Return {
        server: Box<Server>,
        database: String,
        cluster: String,
        client_pid: i32,
    },
    Close {
        server: Box<Server>,
        database: String,
        cluster: String,
        client_pid: i32,
    },
    GetMapping {
        client_pid: i32,
        responder: MappingResponder,
    },
}

/// The sending side handed to client sessions. The receiving side is kept
/// behind a shared mutex so a supervisor restart re-attaches to the same
/// inbox instead of orphaning every requester.
pub type PoolInbox = Arc<Mutex<mpsc::Receiver<PoolRequest>>>;

#[derive(Clone)]
pub struct ConnectionRequester {
    tx: mpsc::Sender<PoolRequest>,
}

impl ConnectionRequester {
    pub fn new_pair() -> (ConnectionRequester, PoolInbox) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        (ConnectionRequester { tx }, Arc::new(Mutex::new(rx)))
    }

    /// Lease a session for one query.
    pub async fn request_connection(
        &self,
        database: &str,
        cluster: &str,
        client_pid: i32,
    ) -> Result<Server, Error> {
        let (responder, response) = oneshot::channel();
        self.tx
            .send(PoolRequest::Get {
                database: database.to_string(),
                cluster: cluster.to_string(),
                client_pid,
                responder,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Hand a leased session back. A poisoned session is closed instead of
    /// pooled.
    pub async fn return_connection(&self, server: Server, client_pid: i32) {
        let database = server.database_name().to_string();
        let cluster = server.cluster_name().to_string();
        let request = if server.is_poisoned() {
            PoolRequest::Close {
                server: Box::new(server),
                database,
                cluster,
                client_pid,
            }
        } else {
            PoolRequest::Return {
                server: Box::new(server),
                database,
                cluster,
                client_pid,
            }
        };
        if self.tx.send(request).await.is_err() {
            warn!("Pool manager is gone, dropping returned connection");
        }
    }

    /// The identities of every upstream currently or recently leased for a
    /// client, used solely to route cancel requests.
    pub async fn request_connection_mapping(
        &self,
        client_pid: i32,
    ) -> Result<Vec<ServerProcessIdentity>, Error> {
        let (responder, response) = oneshot::channel();
        self.tx
            .send(PoolRequest::GetMapping {
                client_pid,
                responder,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)?
    }
}

/// Idle sessions for one (database, cluster) pair, LIFO. `open` counts
/// pooled and leased sessions together so MaxOpenConns bounds the total;
/// requesters that arrive at the bound park until a Return or Close frees
/// capacity.
struct Pool {
    database: Arc<DatabaseConfig>,
    cluster: Arc<ClusterConfig>,
    connections: Vec<Server>,
    open: usize,
    waiters: VecDeque<(i32, GetResponder)>,
}

impl Pool {
    fn new(database: Arc<DatabaseConfig>, cluster: Arc<ClusterConfig>) -> Pool {
        let capacity = database.pool_settings.max_open_conns;
        Pool {
            database,
            cluster,
            connections: Vec::with_capacity(capacity),
            open: 0,
            waiters: VecDeque::new(),
        }
    }

    fn addr(&self) -> String {
        self.cluster.addr()
    }

    fn max_open(&self) -> usize {
        self.database.pool_settings.max_open_conns
    }

    fn lifetime(&self) -> Duration {
        Duration::from_secs(self.database.pool_settings.max_conn_lifetime)
    }

    fn has_capacity(&self) -> bool {
        self.open < self.max_open()
    }

    /// LIFO pop, closing poisoned and overaged sessions on the way.
    fn checkout_idle(&mut self) -> Option<Server> {
        loop {
            match self.connections.pop() {
                None => return None,
                Some(server) if server.is_poisoned() => {
                    self.open -= 1;
                    drop(server);
                }
                Some(server) if server.age() > self.lifetime() => {
                    info!(
                        "Closing connection to {}. Connection has exceeded max lifetime \
                         (backend pid {})",
                        self.addr(),
                        server.backend_pid()
                    );
                    self.open -= 1;
                    drop(server);
                }
                Some(server) => return Some(server),
            }
        }
    }

    async fn dial(&mut self) -> Result<Server, Error> {
        let server = Server::startup(self.database.clone(), self.cluster.clone()).await?;
        self.open += 1;
        Ok(server)
    }

    fn park(&mut self, client_pid: i32, responder: GetResponder) {
        info!(
            "Pool {} is at MaxOpenConns ({}), queueing request from client {}",
            self.addr(),
            self.max_open(),
            client_pid
        );
        self.waiters.push_back((client_pid, responder));
    }

    fn next_waiter(&mut self) -> Option<(i32, GetResponder)> {
        self.waiters.pop_front()
    }

    /// Put a session back on the stack, or close it when the pool is full
    /// or the session aged out.
    fn checkin(&mut self, server: Server) {
        if server.is_poisoned() {
            self.open -= 1;
            drop(server);
            return;
        }
        if server.age() > self.lifetime() {
            info!(
                "Closing connection to {}. Connection has exceeded max lifetime \
                 (backend pid {})",
                self.addr(),
                server.backend_pid()
            );
            self.open -= 1;
            drop(server);
            return;
        }
        if self.connections.len() >= self.max_open() {
            info!(
                "Closing connection to {}. Pool is full (backend pid {})",
                self.addr(),
                server.backend_pid()
            );
            self.open -= 1;
            drop(server);
            return;
        }
        debug!(
            "Returning connection to pool {} (backend pid {})",
            self.addr(),
            server.backend_pid()
        );
        self.connections.push(server);
    }

    /// Close a session unconditionally.
    fn discard(&mut self, server: Server) {
        self.open -= 1;
        drop(server);
    }

    /// Close pooled sessions older than MaxConnLifetime. Leased sessions
    /// are not in the stack, so walking it is sufficient.
    fn sweep(&mut self) {
        let lifetime = self.lifetime();
        let addr = self.addr();
        let before = self.connections.len();
        self.connections.retain(|server| {
            if server.age() > lifetime {
                info!(
                    "Sweeping connection to {addr}. Connection has exceeded max lifetime \
                     (backend pid {})",
                    server.backend_pid()
                );
                false
            } else {
                true
            }
        });
        self.open -= before - self.connections.len();
    }
}

/// The actor state: every pool plus the client->backend mapping.
pub struct PoolManager {
    pools: HashMap<(String, String), Pool>,
    client_map: HashMap<i32, Vec<ServerProcessIdentity>>,
}

impl PoolManager {
    pub fn from_config(config: &SpannerConfig) -> PoolManager {
        let mut pools = HashMap::new();
        for database in &config.databases {
            let database = Arc::new(database.clone());
            for cluster in &database.clusters {
                let cluster = Arc::new(cluster.clone());
                pools.insert(
                    (database.name.clone(), cluster.name.clone()),
                    Pool::new(database.clone(), cluster),
                );
            }
        }
        PoolManager {
            pools,
            client_map: HashMap::new(),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    async fn handle(&mut self, request: PoolRequest) {
        match request {
            PoolRequest::Get {
                database,
                cluster,
                client_pid,
                responder,
            } => self.get(&database, &cluster, client_pid, responder).await,
            PoolRequest::Return {
                server,
                database,
                cluster,
                client_pid,
            } => {
                self.remove_mapping(client_pid, server.identity().clone());
                self.checkin(&database, &cluster, *server).await;
            }
            PoolRequest::Close {
                server,
                database,
                cluster,
                client_pid,
            } => {
                self.remove_mapping(client_pid, server.identity().clone());
                self.close(&database, &cluster, *server).await;
            }
            PoolRequest::GetMapping {
                client_pid,
                responder,
            } => {
                let response = match self.client_map.get(&client_pid) {
                    Some(identities) => Ok(identities.clone()),
                    None => Err(Error::MappingNotFound(client_pid)),
                };
                let _ = responder.send(response);
            }
        }
    }

    async fn get(
        &mut self,
        database: &str,
        cluster: &str,
        client_pid: i32,
        responder: GetResponder,
    ) {
        let Some(pool) = self.pools.get_mut(&(database.to_string(), cluster.to_string())) else {
            let _ = responder.send(Err(Error::BadConfig(format!(
                "no pool for {database}/{cluster}"
            ))));
            return;
        };

        if let Some(server) = pool.checkout_idle() {
            self.grant(database, cluster, client_pid, responder, server);
            return;
        }

        if !pool.has_capacity() {
            pool.park(client_pid, responder);
            return;
        }

        match pool.dial().await {
            Ok(server) => self.grant(database, cluster, client_pid, responder, server),
            Err(err) => {
                error!("Error creating connection to {database}/{cluster}: {err}");
                let _ = responder.send(Err(err));
            }
        }
    }

    /// Record the lease and reply. When the requester is already gone the
    /// session goes straight back to the pool.
    fn grant(
        &mut self,
        database: &str,
        cluster: &str,
        client_pid: i32,
        responder: GetResponder,
        server: Server,
    ) {
        let identity = server.identity().clone();
        self.client_map
            .entry(client_pid)
            .or_default()
            .push(identity.clone());

        if let Err(Ok(server)) = responder.send(Ok(server)) {
            debug!("Client {client_pid} went away before its lease arrived");
            self.remove_mapping(client_pid, identity);
            if let Some(pool) = self
                .pools
                .get_mut(&(database.to_string(), cluster.to_string()))
            {
                pool.checkin(server);
            }
        }
    }

    async fn checkin(&mut self, database: &str, cluster: &str, server: Server) {
        let Some(pool) = self.pools.get_mut(&(database.to_string(), cluster.to_string())) else {
            return;
        };

        if server.is_poisoned() || server.age() > pool.lifetime() {
            pool.discard(server);
            self.refill_waiters(database, cluster).await;
            return;
        }

        // A parked requester takes the session over directly.
        if let Some((waiter_pid, waiter)) = pool.next_waiter() {
            self.grant(database, cluster, waiter_pid, waiter, server);
            return;
        }

        pool.checkin(server);
    }

    async fn close(&mut self, database: &str, cluster: &str, server: Server) {
        if let Some(pool) = self.pools.get_mut(&(database.to_string(), cluster.to_string())) {
            pool.discard(server);
        }
        self.refill_waiters(database, cluster).await;
    }

    /// Freed capacity serves parked requesters with fresh dials.
    async fn refill_waiters(&mut self, database: &str, cluster: &str) {
        loop {
            let Some(pool) = self.pools.get_mut(&(database.to_string(), cluster.to_string()))
            else {
                return;
            };
            if !pool.has_capacity() || pool.waiters.is_empty() {
                return;
            }
            let (waiter_pid, waiter) = match pool.next_waiter() {
                Some(waiter) => waiter,
                None => return,
            };
            match pool.dial().await {
                Ok(server) => self.grant(database, cluster, waiter_pid, waiter, server),
                Err(err) => {
                    error!("Error creating connection to {database}/{cluster}: {err}");
                    let _ = waiter.send(Err(err));
                }
            }
        }
    }

    fn remove_mapping(&mut self, client_pid: i32, identity: ServerProcessIdentity) {
        if let Some(identities) = self.client_map.get_mut(&client_pid) {
            if let Some(position) = identities.iter().position(|entry| *entry == identity) {
                identities.swap_remove(position);
            }
            if identities.is_empty() {
                self.client_map.remove(&client_pid);
            }
        }
    }

    fn sweep(&mut self) {
        for pool in self.pools.values_mut() {
            pool.sweep();
        }
    }
}

/// The actor task. Owns the manager state for its lifetime; on restart the
/// state is rebuilt from the config and the shared inbox is re-acquired.
pub async fn run_pool_manager(inbox: PoolInbox, keep_alive: KeepAlive) -> Result<(), Error> {
    let config = get_config();
    let mut manager = PoolManager::from_config(&config);
    info!("Pool manager started with {} pools", manager.pool_count());

    let mut inbox = inbox.lock().await;
    let mut sweep = tokio::time::interval(CONNECTION_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            request = inbox.recv() => match request {
                Some(request) => manager.handle(request).await,
                None => {
                    warn!("Pool manager inbox closed, shutting down");
                    return Ok(());
                }
            },
            _ = sweep.tick() => {
                manager.sweep();
                keep_alive.notify();
            }
        }
    }
}
