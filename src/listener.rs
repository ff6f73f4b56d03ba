// The accept loop. One task per accepted client; the keep-alive is pinged
// on every accept and on every accept deadline so the supervisor can tell
// a quiet listener from a dead one.

// Standard library imports
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

// External crate imports
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use tokio::net::TcpSocket;
use tokio::time::timeout;

// Internal crate imports
use crate::client::client_entrypoint;
use crate::config::get_config;
use crate::errors::Error;
use crate::keepalive::KeepAlive;
use crate::messages::configure_tcp_socket;
use crate::pool::ConnectionRequester;

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

// Monotonic for the process lifetime, so client pids stay unique across
// listener restarts.
static NEXT_CLIENT_PID: Lazy<AtomicI32> = Lazy::new(|| AtomicI32::new(1));

fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener, Error> {
    let addr = addr
        .parse()
        .map_err(|err| Error::BadConfig(format!("Bad listen address {addr}: {err}")))?;
    let socket = TcpSocket::new_v4().map_err(|err| Error::SocketError(err.to_string()))?;
    socket
        .set_reuseaddr(true)
        .map_err(|err| Error::SocketError(err.to_string()))?;
    socket
        .set_reuseport(true)
        .map_err(|err| Error::SocketError(err.to_string()))?;
    socket
        .bind(addr)
        .map_err(|err| Error::SocketError(format!("Could not bind {addr}: {err}")))?;
    socket
        .listen(1024)
        .map_err(|err| Error::SocketError(format!("Could not listen on {addr}: {err}")))
}

pub async fn run_client_listener(
    requester: ConnectionRequester,
    keep_alive: KeepAlive,
) -> Result<(), Error> {
    let config = get_config();
    let addr = format!("{}:{}", config.listen_addr(), config.listen_port);

    // A bad listen address is unrecoverable; reuseaddr/reuseport keep a
    // supervisor-restarted listener from tripping over its predecessor.
    let listener = match bind_listener(&addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Listener socket error: {err}");
            std::process::exit(exitcode::IOERR);
        }
    };
    info!("Listening on {addr}");

    loop {
        match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_) => {
                debug!("Client listener accept deadline elapsed");
                keep_alive.notify();
            }
            Ok(Err(err)) => {
                error!("accept error: {err:?}");
            }
            Ok(Ok((socket, peer))) => {
                configure_tcp_socket(&socket);
                let client_pid = NEXT_CLIENT_PID.fetch_add(1, Ordering::SeqCst);
                info!("Client {peer} connected, client pid {client_pid}");

                let requester = requester.clone();
                tokio::spawn(async move {
                    let started = chrono::offset::Utc::now().naive_utc();
                    let result = client_entrypoint(socket, requester, client_pid).await;
                    let duration = chrono::offset::Utc::now().naive_utc() - started;
                    match result {
                        Ok(()) => info!(
                            "Client {peer} disconnected, session duration: {}",
                            crate::format_duration(&duration)
                        ),
                        Err(err) => warn!(
                            "Client {peer} disconnected with error {err}, duration: {}",
                            crate::format_duration(&duration)
                        ),
                    }
                });
                keep_alive.notify();
            }
        }
    }
}
