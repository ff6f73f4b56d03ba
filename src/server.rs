/// Implementation of the PostgreSQL server (database) protocol.
/// Here we are pretending to be a Postgres client.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{error, info, warn};
use tokio::io::BufStream;
use tokio::net::{lookup_host, TcpStream};

use crate::auth::{md5_password, select_sasl_mechanism, ScramSha256};
use crate::config::{ClusterConfig, DatabaseConfig};
use crate::constants::SCRAM_SHA_256;
use crate::errors::{Error, ServerIdentifier};
use crate::messages::configure_tcp_socket;
use crate::messages::error::ErrorResponse;
use crate::messages::protocol::{
    AuthenticationRequest, BackendKeyData, CancelRequest, ParameterStatus, PasswordMessage,
    QueryMessage, RawMessage, SASLInitialResponse, SASLResponse, StartupMessage,
};
use crate::messages::socket::{read_message, write_all_flush};

/// The application name the proxy announces to upstream servers.
const UPSTREAM_APPLICATION_NAME: &str = "pgspanner";

/// Where a leased backend process lives. Captured from BackendKeyData during
/// startup; required to route cancel requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerProcessIdentity {
    pub backend_pid: i32,
    pub backend_key: i32,
    pub database_name: String,
    pub cluster_host: String,
    pub cluster_port: u16,
}

impl ServerProcessIdentity {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.cluster_host, self.cluster_port)
    }
}

/// One authenticated TCP session to an upstream cluster.
#[derive(Debug)]
pub struct Server {
    /// The logical database this session was opened for.
    database: Arc<DatabaseConfig>,

    /// The cluster the session is connected to.
    cluster: Arc<ClusterConfig>,

    /// Server connection.
    stream: BufStream<TcpStream>,

    /// Server information the server sent us over on startup.
    parameters: HashMap<String, String>,

    /// Backend pid and secret key used for query cancellation.
    identity: ServerProcessIdentity,

    /// Session age drives pool eviction.
    connected_at: Instant,

    /// Set on any I/O error. A poisoned session is closed, never pooled.
    poisoned: bool,

    /// Server connected at, for the shutdown log line.
    started_at: chrono::naive::NaiveDateTime,
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{}]-{}@{}:{}/{}",
            self.identity.backend_pid,
            self.cluster.user,
            self.cluster.host,
            self.cluster.port,
            self.database.name
        )
    }
}

impl Server {
    /// Resolve and dial a cluster. When exactly two addresses resolve the
    /// second is used, otherwise the first.
    async fn connect(host: &str, port: u16) -> Result<TcpStream, Error> {
        let addrs: Vec<SocketAddr> = match lookup_host(format!("{host}:{port}")).await {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                return Err(Error::SocketError(format!(
                    "Could not resolve {host}:{port}: {err}"
                )))
            }
        };

        let addr = match addrs.len() {
            0 => {
                return Err(Error::SocketError(format!(
                    "No addresses resolved for {host}:{port}"
                )))
            }
            2 => addrs[1],
            _ => addrs[0],
        };

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(err) => {
                error!("Could not connect to server: {err}");
                return Err(Error::SocketError(format!(
                    "Could not connect to server: {err}"
                )));
            }
        };
        configure_tcp_socket(&stream);

        Ok(stream)
    }

    /// Pretend to be the Postgres client: connect, authenticate and return
    /// the session in a ready-for-query state.
    pub async fn startup(
        database: Arc<DatabaseConfig>,
        cluster: Arc<ClusterConfig>,
    ) -> Result<Server, Error> {
        let server_identifier = ServerIdentifier::new(cluster.user.clone(), &database.name);

        // The password is read from the environment at handshake time.
        let password = cluster.password()?;

        let stream = Self::connect(&cluster.host, cluster.port).await?;
        let mut stream = BufStream::new(stream);

        let mut startup = StartupMessage::new(&cluster.user, &cluster.name);
        startup
            .options
            .insert("client_encoding".to_string(), "UTF8".to_string());
        startup.options.insert(
            "application_name".to_string(),
            UPSTREAM_APPLICATION_NAME.to_string(),
        );
        write_all_flush(&mut stream, &startup.pack()).await?;

        let mut scram: Option<ScramSha256> = None;
        let mut parameters = HashMap::new();
        let mut identity = ServerProcessIdentity {
            database_name: database.name.clone(),
            cluster_host: cluster.host.clone(),
            cluster_port: cluster.port,
            ..Default::default()
        };

        loop {
            let message = match read_message(&mut stream).await {
                Ok(message) => message,
                Err(err) => {
                    return Err(Error::ServerStartupError(
                        err.to_string(),
                        server_identifier,
                    ))
                }
            };

            match message.kind as u8 {
                // Authentication
                b'R' => match AuthenticationRequest::unpack(&message)? {
                    AuthenticationRequest::Ok => (),
                    AuthenticationRequest::Md5Password { salt } => {
                        let hashed = md5_password(&cluster.user, &password, &salt);
                        let response = PasswordMessage::new(hashed);
                        write_all_flush(&mut stream, &response.pack()).await?;
                    }
                    AuthenticationRequest::Sasl { mechanisms } => {
                        select_sasl_mechanism(&mechanisms).map_err(|err| {
                            Error::ServerAuthError(err.to_string(), server_identifier.clone())
                        })?;
                        let exchange = ScramSha256::new(&password);
                        let response =
                            SASLInitialResponse::new(SCRAM_SHA_256, exchange.message().to_vec());
                        write_all_flush(&mut stream, &response.pack()).await?;
                        scram = Some(exchange);
                    }
                    AuthenticationRequest::SaslContinue { data } => {
                        let exchange = scram.as_mut().ok_or_else(|| {
                            Error::ServerAuthError(
                                "SASL challenge without an exchange in progress".to_string(),
                                server_identifier.clone(),
                            )
                        })?;
                        let proof = exchange.update(&data)?;
                        let response = SASLResponse::new(proof);
                        write_all_flush(&mut stream, &response.pack()).await?;
                    }
                    AuthenticationRequest::SaslFinal { data } => {
                        let exchange = scram.as_mut().ok_or_else(|| {
                            Error::ServerAuthError(
                                "SASL final without an exchange in progress".to_string(),
                                server_identifier.clone(),
                            )
                        })?;
                        exchange.finish(&data)?;
                    }
                },

                // ParameterStatus
                b'S' => {
                    let status = ParameterStatus::unpack(&message)?;
                    parameters.insert(status.name, status.value);
                }

                // BackendKeyData
                b'K' => {
                    let key_data = BackendKeyData::unpack(&message)?;
                    identity.backend_pid = key_data.process_id;
                    identity.backend_key = key_data.secret_key;
                }

                // ReadyForQuery: the handshake is complete.
                b'Z' => {
                    info!(
                        "Created new server connection to {}:{} for database {} \
                         (backend pid {})",
                        cluster.host, cluster.port, database.name, identity.backend_pid
                    );
                    return Ok(Server {
                        database,
                        cluster,
                        stream,
                        parameters,
                        identity,
                        connected_at: Instant::now(),
                        poisoned: false,
                        started_at: chrono::offset::Utc::now().naive_utc(),
                    });
                }

                // ErrorResponse: fail the dial, keeping the real SQLSTATE.
                b'E' => {
                    let response = ErrorResponse::unpack(&message)?;
                    error!(
                        "Server startup failed for {server_identifier}: {} ({}) {}",
                        response.severity(),
                        response.code(),
                        response
                    );
                    return Err(Error::Upstream(response));
                }

                // NoticeResponse: same field layout as an error, not fatal.
                b'N' => {
                    if let Ok(notice) = ErrorResponse::unpack(&message) {
                        warn!("Server startup notice for {server_identifier}: {notice}");
                    }
                }

                kind => {
                    return Err(Error::ProtocolSyncError(format!(
                        "unexpected message '{}' from server during startup",
                        kind as char
                    )));
                }
            }
        }
    }

    /// Send a simple query. The caller pumps the responses off the session
    /// with `read_message` until ReadyForQuery.
    pub async fn issue_query(&mut self, query: &str) -> Result<(), Error> {
        let message = QueryMessage::new(query).pack();
        self.send(&message).await
    }

    async fn send(&mut self, buf: &BytesMut) -> Result<(), Error> {
        match write_all_flush(&mut self.stream, buf).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Terminating server {self} because of: {err}");
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Read the next backend message, poisoning the session on any error.
    pub async fn read_message(&mut self) -> Result<RawMessage, Error> {
        match read_message(&mut self.stream).await {
            Ok(message) => Ok(message),
            Err(err) => {
                error!("Terminating server {self} because of: {err}");
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// Issue a query cancellation request. Uses a separate connection that
    /// is not part of the connection pool.
    pub async fn cancel(
        host: &str,
        port: u16,
        backend_pid: i32,
        backend_key: i32,
    ) -> Result<(), Error> {
        let mut stream = Self::connect(host, port).await?;

        warn!("Sending CancelRequest to [{backend_pid}] {host}:{port}");

        let request = CancelRequest::new(backend_pid, backend_key).pack();
        write_all_flush(&mut stream, &request).await
    }

    #[inline(always)]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Mark the session unusable, e.g. when the client side of a pump dies.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    #[inline(always)]
    pub fn identity(&self) -> &ServerProcessIdentity {
        &self.identity
    }

    #[inline(always)]
    pub fn backend_pid(&self) -> i32 {
        self.identity.backend_pid
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn database_name(&self) -> &str {
        &self.database.name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster.name
    }

    /// Startup parameters the server reported.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

impl Drop for Server {
    /// Try to do a clean shut down. Best effort because the socket is in
    /// non-blocking mode, so it may not be ready for a write.
    fn drop(&mut self) {
        if !self.poisoned {
            let terminate: [u8; 5] = [b'X', 0, 0, 0, 4];
            match self.stream.get_mut().try_write(&terminate) {
                Ok(5) => (),
                Err(err) => warn!("Dirty server {self} shutdown: {err}"),
                _ => warn!("Dirty server {self} shutdown"),
            };
        }

        let now = chrono::offset::Utc::now().naive_utc();
        let duration = now - self.started_at;

        let message = if self.poisoned {
            "Server connection terminated"
        } else {
            "Server connection closed"
        };

        info!(
            "{} {}, session duration: {}",
            message,
            self,
            crate::format_duration(&duration)
        );
    }
}
