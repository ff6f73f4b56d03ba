/// Handle clients by pretending to be a PostgreSQL server.
use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};

use crate::config::{get_config, DatabaseConfig};
use crate::constants::CANCEL_MESSAGE_KIND;
use crate::errors::Error;
use crate::messages::error::ErrorResponse;
use crate::messages::protocol::{
    AuthenticationRequest, BackendKeyData, CancelRequest, ParameterStatus, QueryMessage,
    ReadyForQuery, StartupMessage,
};
use crate::messages::socket::{read_message, read_startup_message, write_all_flush};
use crate::pool::ConnectionRequester;
use crate::server::Server;

/// The parameter set every client is told about during the startup ACK.
/// Values are synthetic; the real upstream parameters stay server-side.
fn static_server_configuration(user: &str) -> [(&'static str, String); 11] {
    [
        ("application_name", "psql".to_string()),
        ("client_encoding", "UTF8".to_string()),
        ("DateStyle", "ISO, MDY".to_string()),
        ("integer_datetimes", "on".to_string()),
        ("IntervalStyle", "postgres".to_string()),
        ("is_superuser", "on".to_string()),
        ("server_encoding", "UTF8".to_string()),
        ("server_version", "pgspanner-0.1".to_string()),
        ("session_authorization", user.to_string()),
        ("standard_conforming_strings", "on".to_string()),
        ("TimeZone", "UTC".to_string()),
    ]
}

/// Group the auth and config messages into one write.
fn config_packet(user: &str, client_pid: i32, client_secret: i32) -> BytesMut {
    let mut packet = BytesMut::with_capacity(1024);
    packet.put(AuthenticationRequest::Ok.pack());
    for (name, value) in static_server_configuration(user) {
        packet.put(ParameterStatus::new(name, &value).pack());
    }
    packet.put(BackendKeyData::new(client_pid, client_secret).pack());
    packet.put(ReadyForQuery::idle().pack());
    packet
}

fn error_response_packet(response: &ErrorResponse) -> BytesMut {
    let mut packet = response.pack();
    packet.put(ReadyForQuery::idle().pack());
    packet
}

/// One task per client connection. Generic over the stream so tests can
/// drive the whole state machine over in-memory pipes.
pub async fn client_entrypoint<S>(
    mut stream: S,
    requester: ConnectionRequester,
    client_pid: i32,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    // SSL refusal and re-read happen inside the startup reader.
    let raw_message = read_startup_message(&mut stream).await?;

    if raw_message.kind == CANCEL_MESSAGE_KIND {
        let cancel = CancelRequest::unpack(&raw_message)?;
        dispatch_cancel(&cancel, &requester).await;
        return Ok(());
    }

    // Before the client has seen ReadyForQuery, protocol violations get a
    // synthesized ErrorResponse; afterwards the connection just closes.
    let startup = match StartupMessage::unpack(&raw_message) {
        Ok(startup) => startup,
        Err(err) => {
            warn!("Client {client_pid} sent a bad startup message: {err}");
            let response = ErrorResponse::fatal("08000", &err.to_string());
            let _ = write_all_flush(&mut stream, &response.pack()).await;
            return Err(err);
        }
    };

    let config = get_config();
    let database = match config.database(&startup.database) {
        Some(database) => database.clone(),
        None => {
            warn!(
                "Client {client_pid} asked for unknown database {}",
                startup.database
            );
            let response = ErrorResponse::fatal(
                "08000",
                &format!("Database {} not found", startup.database),
            );
            write_all_flush(&mut stream, &response.pack()).await?;
            return Ok(());
        }
    };

    // The client secret is the client pid: the proxy only ever routes
    // cancels it minted itself, so an unpredictable secret buys nothing.
    let client_secret = client_pid;
    write_all_flush(
        &mut stream,
        &config_packet(&startup.user, client_pid, client_secret),
    )
    .await?;
    info!(
        "Client {client_pid} connected as {} to database {}",
        startup.user, database.name
    );

    loop {
        let message = match read_message(&mut stream).await {
            Ok(message) => message,
            Err(err) => {
                debug!("Client {client_pid} socket closed: {err}");
                return Ok(());
            }
        };

        match message.kind {
            CANCEL_MESSAGE_KIND => {
                let cancel = CancelRequest::unpack(&message)?;
                dispatch_cancel(&cancel, &requester).await;
            }
            kind if kind == b'Q' as i32 => {
                let query = QueryMessage::unpack(&message)?;
                debug!("Client {client_pid} query: {}", query.query);
                handle_query(&mut stream, &requester, &database, &query.query, client_pid).await?;
            }
            kind if kind == b'X' as i32 => {
                info!("Client {client_pid} terminated the session");
                return Ok(());
            }
            kind if kind == b'E' as i32 => {
                // A misbehaving client echoing a server error at us: log it
                // and reflect it back.
                if let Ok(response) = ErrorResponse::unpack(&message) {
                    error!(
                        "Client {client_pid} sent an error response: {} ({}) {}",
                        response.severity(),
                        response.code(),
                        response
                    );
                }
                write_all_flush(&mut stream, &message.pack()).await?;
            }
            kind => {
                warn!("Client {client_pid}: unknown message kind: {kind}");
            }
        }
    }
}

/// Lease a session from the first listed cluster, forward the query, pump
/// the responses back until ReadyForQuery, return the session.
async fn handle_query<S>(
    stream: &mut S,
    requester: &ConnectionRequester,
    database: &DatabaseConfig,
    query: &str,
    client_pid: i32,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + std::marker::Unpin,
{
    let cluster = &database.clusters[0];

    let mut server = match requester
        .request_connection(&database.name, &cluster.name, client_pid)
        .await
    {
        Ok(server) => server,
        Err(err) => {
            error!(
                "Error requesting connection to {} for client {client_pid}: {err}",
                cluster.addr()
            );
            // An upstream ErrorResponse travels to the client verbatim so
            // it sees the real SQLSTATE; everything else becomes 08000.
            let response = match err {
                Error::Upstream(response) => response,
                other => ErrorResponse::connection_error(
                    &format!(
                        "Failed to open connection to cluster {} for database {}",
                        cluster.addr(),
                        database.name
                    ),
                    &other.to_string(),
                    "08000",
                    "handle_query",
                ),
            };
            write_all_flush(stream, &error_response_packet(&response)).await?;
            return Ok(());
        }
    };

    if let Err(err) = server.issue_query(query).await {
        error!("Error issuing query for client {client_pid}: {err}");
        requester.return_connection(server, client_pid).await;
        let response = ErrorResponse::connection_error(
            &format!(
                "Failed to forward query to cluster {} for database {}",
                cluster.addr(),
                database.name
            ),
            &err.to_string(),
            "08000",
            "handle_query",
        );
        write_all_flush(stream, &error_response_packet(&response)).await?;
        return Ok(());
    }

    let result = pump_until_ready(stream, &mut server, client_pid).await;
    requester.return_connection(server, client_pid).await;
    result
}

/// Forward backend messages byte for byte until ReadyForQuery.
async fn pump_until_ready<S>(
    stream: &mut S,
    server: &mut Server,
    client_pid: i32,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    loop {
        let message = match server.read_message().await {
            Ok(message) => message,
            Err(err) => {
                // The session is poisoned; whatever was already forwarded
                // is the last thing the client sees of this query.
                error!("Error reading query response for client {client_pid}: {err}");
                return Ok(());
            }
        };

        if let Err(err) = write_all_flush(stream, &message.pack()).await {
            server.poison();
            return Err(err);
        }

        if message.kind == b'Z' as i32 {
            return Ok(());
        }
    }
}

/// Route a CancelRequest. The pid the client sent is the proxy-minted
/// client pid; the mapping translates it into real upstream identities,
/// each cancelled over a fresh unauthenticated connection.
pub async fn dispatch_cancel(cancel: &CancelRequest, requester: &ConnectionRequester) {
    info!(
        "Received cancel request, forwarding to server (client pid {})",
        cancel.backend_pid
    );

    let identities = match requester
        .request_connection_mapping(cancel.backend_pid)
        .await
    {
        Ok(identities) => identities,
        Err(err) => {
            error!("Error requesting connection mapping: {err}");
            return;
        }
    };

    let config = get_config();
    for identity in identities {
        let Some(database) = config.database(&identity.database_name) else {
            error!("Database config not found: {}", identity.database_name);
            continue;
        };
        if database
            .cluster_by_addr(&identity.cluster_host, identity.cluster_port)
            .is_none()
        {
            error!("Cluster config not found: {}", identity.addr());
            continue;
        }
        // An identity without a captured backend pid cannot be cancelled.
        if identity.backend_pid == 0 {
            continue;
        }

        info!(
            "Sending cancel request to {} (backend pid {})",
            identity.addr(),
            identity.backend_pid
        );
        if let Err(err) = Server::cancel(
            &identity.cluster_host,
            identity.cluster_port,
            identity.backend_pid,
            identity.backend_key,
        )
        .await
        {
            error!("Error sending cancel request to {}: {err}", identity.addr());
        }
    }
}
