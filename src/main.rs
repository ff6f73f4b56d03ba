#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::time::Duration;

use log::{error, info};
use tokio::runtime::Builder;
use tokio::signal::unix::{signal as unix_signal, SignalKind};

extern crate exitcode;

use pg_spanner::cmd_args;
use pg_spanner::config::{self, get_config, VERSION};
use pg_spanner::keepalive::{run_keep_alive_handler, start_component};
use pg_spanner::listener::run_client_listener;
use pg_spanner::logger;
use pg_spanner::pool::{run_pool_manager, ConnectionRequester};

// The pool manager ticks on every sweep (5s), the listener on every accept
// deadline (10s); both get headroom before the supervisor steps in.
const POOL_MANAGER_TIMEOUT: Duration = Duration::from_secs(15);
const LISTENER_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cmd_args::parse();

    // Create a transient runtime for loading the config for the first time.
    {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;

        runtime.block_on(async {
            match config::parse(args.config.as_str()).await {
                Ok(_) => (),
                Err(err) => {
                    eprintln!("Config parse error: {err}");
                    std::process::exit(exitcode::CONFIG);
                }
            };
        });
    }

    let config = get_config();
    if let Err(err) = logger::init(&config.logging) {
        eprintln!("Logger error: {err}");
        std::process::exit(exitcode::CONFIG);
    }

    info!("Welcome to PgSpanner! (Version {VERSION})");

    // The config wins over the CLI default when it names a pid file.
    let pid_file = if config.pid_file.is_empty() {
        args.pidfile.clone()
    } else {
        config.pid_file.clone()
    };
    if !pid_file.is_empty() {
        if let Err(err) = std::fs::write(&pid_file, format!("{}\n", std::process::id())) {
            error!("Failed to write pid file {pid_file}: {err}");
            std::process::exit(exitcode::IOERR);
        }
        info!("Wrote pid {} to {pid_file}", std::process::id());
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("worker-pg-spanner")
        .build()?;

    runtime.block_on(async move {
        config.show();

        let (requester, inbox) = ConnectionRequester::new_pair();
        let nokeepalive = args.nokeepalive;
        if nokeepalive {
            info!("Keep-alive supervision disabled");
        }

        let pool_component = start_component(
            "pool-manager",
            POOL_MANAGER_TIMEOUT,
            nokeepalive,
            move |keep_alive| {
                let inbox = inbox.clone();
                run_pool_manager(inbox, keep_alive)
            },
        );

        let listener_requester = requester.clone();
        let listener_component = start_component(
            "client-listener",
            LISTENER_TIMEOUT,
            nokeepalive,
            move |keep_alive| {
                let requester = listener_requester.clone();
                run_client_listener(requester, keep_alive)
            },
        );

        let components = vec![pool_component, listener_component];

        let mut term_signal = unix_signal(SignalKind::terminate()).unwrap();
        let mut interrupt_signal = unix_signal(SignalKind::interrupt()).unwrap();

        info!("Waiting for dear clients");
        tokio::select! {
            _ = term_signal.recv() => {
                info!("Got SIGTERM, shutting down");
            }
            _ = interrupt_signal.recv() => {
                info!("Got SIGINT, shutting down");
            }
            _ = run_keep_alive_handler(components), if !nokeepalive => {}
        }
    });

    info!("Shutting down...");
    Ok(())
}
