// Heartbeat-and-restart supervision. Components push a tick whenever they
// make progress; the supervisor samples the tick channels on a timer and
// respawns any component that stayed silent for a whole period. The tokio
// task boundary doubles as the panic-recovery boundary: a panicking
// component takes down only its own task, and the monitor logs the exit.

// Standard library imports
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

// External crate imports
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

// Internal crate imports
use crate::errors::Error;

pub const KEEP_ALIVE_QUEUE_DEPTH: usize = 10;

/// Handle a component uses to report liveness.
#[derive(Clone)]
pub struct KeepAlive {
    name: &'static str,
    ticks: mpsc::Sender<()>,
    timeout: Duration,
    disabled: bool,
}

impl KeepAlive {
    /// Report progress. Never blocks; a full queue means the supervisor
    /// already has plenty of evidence we are alive.
    pub fn notify(&self) {
        if self.disabled {
            return;
        }
        let _ = self.ticks.try_send(());
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type ComponentFn = Arc<dyn Fn(KeepAlive) -> ComponentFuture + Send + Sync>;

/// A running component paired with the receiving end of its tick channel
/// and the entry function the supervisor restarts it with.
pub struct Component {
    name: &'static str,
    timeout: Duration,
    handle: KeepAlive,
    ticks: mpsc::Receiver<()>,
    entry: ComponentFn,
}

/// Spawn a component under a keep-alive. With `disabled` the component runs
/// unsupervised and `notify` is a no-op (single-process debug mode).
pub fn start_component<F, Fut>(
    name: &'static str,
    timeout: Duration,
    disabled: bool,
    entry: F,
) -> Component
where
    F: Fn(KeepAlive) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let (tx, ticks) = mpsc::channel(KEEP_ALIVE_QUEUE_DEPTH);
    let handle = KeepAlive {
        name,
        ticks: tx,
        timeout,
        disabled,
    };
    let entry: ComponentFn = Arc::new(move |keep_alive| Box::pin(entry(keep_alive)));

    info!("Starting component {name}");
    spawn_monitored(name, &entry, handle.clone());

    Component {
        name,
        timeout,
        handle,
        ticks,
        entry,
    }
}

/// Run the entry future on its own task and log how it ended. A panic is
/// contained by the inner task and surfaces here as a JoinError.
fn spawn_monitored(name: &'static str, entry: &ComponentFn, handle: KeepAlive) {
    let component = entry(handle);
    tokio::spawn(async move {
        match tokio::spawn(component).await {
            Ok(Ok(())) => warn!("Component {name} exited"),
            Ok(Err(err)) => error!("Component {name} failed: {err}"),
            Err(join_error) => error!("Component {name} panicked: {join_error}"),
        }
    });
}

/// The supervisor loop. Samples every component's tick channel once per
/// period (the largest component timeout); a silent component is restarted
/// through its entry function with the same keep-alive handle.
pub async fn run_keep_alive_handler(mut components: Vec<Component>) {
    let period = components
        .iter()
        .map(|component| component.timeout)
        .max()
        .unwrap_or(Duration::from_secs(10));

    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; skip it so components get a full
    // period before the first liveness check.
    interval.tick().await;

    loop {
        interval.tick().await;
        for component in components.iter_mut() {
            debug!("Check for liveness of component {}", component.name);
            match component.ticks.try_recv() {
                Ok(()) => {
                    // Drain the backlog so stale ticks cannot vouch for a
                    // component that dies right after this check.
                    while component.ticks.try_recv().is_ok() {}
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    warn!("Component {} is not alive, restarting", component.name);
                    spawn_monitored(component.name, &component.entry, component.handle.clone());
                }
            }
        }
    }
}
