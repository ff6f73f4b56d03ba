// A scripted PostgreSQL backend for tests: real loopback sockets, the
// server side of the v3 protocol, canned query results. Each accepted
// connection is handed a fresh backend pid so tests can tell sessions
// apart; cancel requests and query texts are recorded for assertions.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::auth::md5_password;
use crate::auth::scram::{hi, hmac_sha256, sha256};
use crate::config::{
    set_config, ClusterConfig, DatabaseConfig, PoolSettings, SpannerConfig,
};
use crate::constants::{CANCEL_REQUEST_CODE, SCRAM_SHA_256};
use crate::messages::protocol::{
    AuthenticationRequest, BackendKeyData, CommandComplete, DataRow, FieldDescription,
    ParameterStatus, RawMessage, ReadyForQuery, RowDescription,
};
use crate::messages::socket::{read_message, write_all_flush};

pub const BACKEND_PID_BASE: i32 = 9000;
pub const BACKEND_KEY_OFFSET: i32 = 1000;

const SCRAM_SALT_B64: &str = "NqkjGpyJLsb2TRd/vhu8pg==";
const SCRAM_ITERATIONS: u32 = 4096;
const SERVER_NONCE_SUFFIX: &str = "C0dywTDp77Sa5H1DrXzlYGNN";

#[derive(Clone)]
pub enum BackendAuth {
    Trust,
    Md5 { user: String, password: String },
    Scram { password: String },
    /// Completes the exchange but lies about the server signature.
    ScramBadSignature { password: String },
}

pub struct MockBackend {
    pub host: String,
    pub port: u16,
    /// (backend_pid, backend_key) pairs received as CancelRequests.
    pub cancels: Arc<Mutex<Vec<(i32, i32)>>>,
    /// Query texts in arrival order, across all connections.
    pub queries: Arc<Mutex<Vec<String>>>,
    /// How many startup connections were accepted.
    pub connections: Arc<AtomicI32>,
}

impl MockBackend {
    pub async fn spawn(auth: BackendAuth) -> MockBackend {
        Self::spawn_with_delay(auth, Duration::from_millis(0)).await
    }

    pub async fn spawn_with_delay(auth: BackendAuth, query_delay: Duration) -> MockBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cancels = Arc::new(Mutex::new(Vec::new()));
        let queries = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicI32::new(0));
        let next_pid = Arc::new(AtomicI32::new(BACKEND_PID_BASE));

        {
            let cancels = cancels.clone();
            let queries = queries.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let auth = auth.clone();
                    let cancels = cancels.clone();
                    let queries = queries.clone();
                    let connections = connections.clone();
                    let next_pid = next_pid.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(
                            socket,
                            auth,
                            cancels,
                            queries,
                            connections,
                            next_pid,
                            query_delay,
                        )
                        .await;
                    });
                }
            });
        }

        MockBackend {
            host: addr.ip().to_string(),
            port: addr.port(),
            cancels,
            queries,
            connections,
        }
    }

    /// A one-database, one-cluster config pointing at this backend,
    /// installed additively so parallel tests do not clobber each other.
    pub fn install_database(
        &self,
        database_name: &str,
        password_env: &str,
        max_open_conns: usize,
        max_conn_lifetime: u64,
    ) -> DatabaseConfig {
        let database = DatabaseConfig {
            name: database_name.to_string(),
            auth_method: "scram".to_string(),
            ssl: false,
            should_pool: true,
            pool_settings: PoolSettings {
                max_open_conns,
                max_idle_conns: max_open_conns,
                max_conn_lifetime,
                idle_conn_lifetime: 60,
            },
            clusters: vec![ClusterConfig {
                name: format!("{database_name}-primary"),
                host: self.host.clone(),
                port: self.port,
                user: "postgres".to_string(),
                password_env: password_env.to_string(),
            }],
        };
        install_database_config(database.clone());
        database
    }
}

static CONFIG_INSTALL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Merge one database into the global config, replacing any same-named
/// entry. Tests use unique database names to stay independent.
pub fn install_database_config(database: DatabaseConfig) {
    let _guard = CONFIG_INSTALL_LOCK.lock().unwrap();
    let mut config: SpannerConfig = crate::config::get_config();
    config.databases.retain(|entry| entry.name != database.name);
    config.databases.push(database);
    set_config(config);
}

async fn handle_connection(
    mut socket: TcpStream,
    auth: BackendAuth,
    cancels: Arc<Mutex<Vec<(i32, i32)>>>,
    queries: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicI32>,
    next_pid: Arc<AtomicI32>,
    query_delay: Duration,
) -> Result<(), crate::errors::Error> {
    let len = socket
        .read_i32()
        .await
        .map_err(|err| crate::errors::Error::SocketError(err.to_string()))?;

    if len == 16 {
        let code = socket.read_i32().await.unwrap();
        let pid = socket.read_i32().await.unwrap();
        let key = socket.read_i32().await.unwrap();
        if code == CANCEL_REQUEST_CODE {
            cancels.lock().await.push((pid, key));
        }
        return Ok(());
    }

    // Startup payload: protocol version + parameters. The scripted backend
    // accepts any of it.
    let mut startup = vec![0u8; len as usize - 4];
    socket.read_exact(&mut startup).await.unwrap();
    connections.fetch_add(1, Ordering::SeqCst);

    match auth {
        BackendAuth::Trust => {
            write_all_flush(&mut socket, &AuthenticationRequest::Ok.pack()).await?;
        }
        BackendAuth::Md5 { user, password } => {
            let salt = [1u8, 2, 3, 4];
            write_all_flush(&mut socket, &AuthenticationRequest::Md5Password { salt }.pack())
                .await?;

            let message = read_message(&mut socket).await?;
            let expected = md5_password(&user, &password, &salt);
            if message.kind != b'p' as i32 || message.payload[..] != expected[..] {
                let response =
                    crate::messages::error::ErrorResponse::fatal("28P01", "password mismatch");
                write_all_flush(&mut socket, &response.pack()).await?;
                return Ok(());
            }
            write_all_flush(&mut socket, &AuthenticationRequest::Ok.pack()).await?;
        }
        BackendAuth::Scram { password } => {
            if !scram_exchange(&mut socket, &password, false).await? {
                return Ok(());
            }
        }
        BackendAuth::ScramBadSignature { password } => {
            scram_exchange(&mut socket, &password, true).await?;
            // The client is expected to hang up on the bad signature.
            return Ok(());
        }
    }

    let pid = next_pid.fetch_add(1, Ordering::SeqCst);
    let mut ack = BytesMut::new();
    ack.extend_from_slice(&ParameterStatus::new("server_version", "14.5").pack());
    ack.extend_from_slice(&ParameterStatus::new("client_encoding", "UTF8").pack());
    ack.extend_from_slice(&BackendKeyData::new(pid, pid + BACKEND_KEY_OFFSET).pack());
    ack.extend_from_slice(&ReadyForQuery::idle().pack());
    write_all_flush(&mut socket, &ack).await?;

    loop {
        let message = match read_message(&mut socket).await {
            Ok(message) => message,
            Err(_) => return Ok(()),
        };

        match message.kind as u8 {
            b'Q' => {
                let query = String::from_utf8_lossy(
                    &message.payload[..message.payload.len().saturating_sub(1)],
                )
                .to_string();
                queries.lock().await.push(query);

                if !query_delay.is_zero() {
                    tokio::time::sleep(query_delay).await;
                }

                let mut response = BytesMut::new();
                response.extend_from_slice(
                    &RowDescription {
                        fields: vec![FieldDescription::text("?column?", 23, 4)],
                    }
                    .pack(),
                );
                response.extend_from_slice(
                    &DataRow {
                        values: vec![Some(b"1".to_vec())],
                    }
                    .pack(),
                );
                response.extend_from_slice(&CommandComplete::new("SELECT 1").pack());
                response.extend_from_slice(&ReadyForQuery::idle().pack());
                write_all_flush(&mut socket, &response).await?;
            }
            b'X' => return Ok(()),
            _ => return Ok(()),
        }
    }
}

/// The server half of SCRAM-SHA-256, verifying the client proof with the
/// same primitives the client derives it from.
async fn scram_exchange(
    socket: &mut TcpStream,
    password: &str,
    lie_about_signature: bool,
) -> Result<bool, crate::errors::Error> {
    let offer = AuthenticationRequest::Sasl {
        mechanisms: vec![SCRAM_SHA_256.to_string()],
    };
    write_all_flush(socket, &offer.pack()).await?;

    let initial = read_message(socket).await?;
    let initial = crate::messages::protocol::SASLInitialResponse::unpack(&initial)?;
    assert_eq!(initial.mechanism, SCRAM_SHA_256);

    let client_first = String::from_utf8(initial.data).unwrap();
    let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
    let client_nonce = client_first_bare.strip_prefix("n=,r=").unwrap().to_string();

    let server_nonce = format!("{client_nonce}{SERVER_NONCE_SUFFIX}");
    let server_first = format!("r={server_nonce},s={SCRAM_SALT_B64},i={SCRAM_ITERATIONS}");
    let challenge = AuthenticationRequest::SaslContinue {
        data: server_first.clone().into_bytes(),
    };
    write_all_flush(socket, &challenge.pack()).await?;

    let response = read_message(socket).await?;
    let client_final = String::from_utf8(response.payload.to_vec()).unwrap();
    let (without_proof, proof_b64) = client_final.rsplit_once(",p=").unwrap();

    let salt = general_purpose::STANDARD.decode(SCRAM_SALT_B64).unwrap();
    let salted_password = hi(password.as_bytes(), &salt, SCRAM_ITERATIONS);
    let client_key = hmac_sha256(&salted_password, b"Client Key");
    let stored_key = sha256(&client_key);
    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

    let mut expected_proof = client_key;
    for (proof, signature) in expected_proof.iter_mut().zip(client_signature.iter()) {
        *proof ^= signature;
    }

    if general_purpose::STANDARD.encode(expected_proof) != proof_b64 {
        let response = crate::messages::error::ErrorResponse::fatal("28P01", "bad proof");
        write_all_flush(socket, &response.pack()).await?;
        return Ok(false);
    }

    let server_key = hmac_sha256(&salted_password, b"Server Key");
    let server_signature = if lie_about_signature {
        general_purpose::STANDARD.encode([0u8; 32])
    } else {
        general_purpose::STANDARD.encode(hmac_sha256(&server_key, auth_message.as_bytes()))
    };

    let final_message = AuthenticationRequest::SaslFinal {
        data: format!("v={server_signature}").into_bytes(),
    };
    write_all_flush(socket, &final_message.pack()).await?;
    write_all_flush(socket, &AuthenticationRequest::Ok.pack()).await?;
    Ok(true)
}

/// Run the pool manager actor for a test, unsupervised.
pub fn spawn_pool_manager(inbox: crate::pool::PoolInbox) {
    let _component = crate::keepalive::start_component(
        "pool-manager",
        Duration::from_secs(60),
        true,
        move |keep_alive| crate::pool::run_pool_manager(inbox.clone(), keep_alive),
    );
}

/// Capture the message sequence a RawMessage stream yields until (and
/// including) ReadyForQuery.
pub async fn read_until_ready<S>(stream: &mut S) -> Vec<RawMessage>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let mut messages = Vec::new();
    loop {
        let message = read_message(stream).await.unwrap();
        let done = message.kind == b'Z' as i32;
        messages.push(message);
        if done {
            return messages;
        }
    }
}
