use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use storefront_events::{EventBus, JobEvent, JobEventKind, Subscription};

/// Handle to control and join a background observer.
#[derive(Debug)]
pub struct ObserverHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ObserverHandle {
    /// Request graceful shutdown and wait for the observer to stop.
    ///
    /// Events already published are handled before the thread exits.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Thread that feeds every lifecycle event from a bus subscription to a handler.
#[derive(Debug)]
pub struct LifecycleObserver;

impl LifecycleObserver {
    /// Subscribe to `bus` and spawn the observer thread.
    ///
    /// The subscription is taken before this returns, so no event published afterwards is missed.
    pub fn spawn<B, H>(name: &'static str, bus: B, mut handler: H) -> std::io::Result<ObserverHandle>
    where
        B: EventBus<JobEvent>,
        H: FnMut(&JobEvent) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || observer_loop(sub, shutdown_rx, &mut handler))?;

        Ok(ObserverHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Log every lifecycle event on `bus`, one line each.
pub fn spawn_lifecycle_logger<B>(bus: B) -> std::io::Result<ObserverHandle>
where
    B: EventBus<JobEvent>,
{
    LifecycleObserver::spawn("lifecycle-logger", bus, log_job_event)
}

pub fn log_job_event(event: &JobEvent) {
    let queue = event.queue.as_str();
    let job_id = event.job_id;

    match &event.kind {
        JobEventKind::Waiting => info!(queue, job_id = %job_id, "job waiting"),
        JobEventKind::Active { attempt } => info!(queue, job_id = %job_id, attempt, "job active"),
        JobEventKind::Completed { .. } => info!(queue, job_id = %job_id, "job completed"),
        JobEventKind::Failed {
            error,
            attempts,
            will_retry,
        } => warn!(
            queue,
            job_id = %job_id,
            attempts,
            will_retry,
            error = %error,
            "job failed"
        ),
        JobEventKind::Stalled => warn!(queue, job_id = %job_id, "job stalled"),
        JobEventKind::Delayed { delay_ms } => info!(queue, job_id = %job_id, delay_ms, "job delayed"),
        JobEventKind::Removed => info!(queue, job_id = %job_id, "job removed"),
    }
}

fn observer_loop<H>(sub: Subscription<JobEvent>, shutdown_rx: mpsc::Receiver<()>, handler: &mut H)
where
    H: FnMut(&JobEvent),
{
    let tick = Duration::from_millis(100);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            for event in sub.drain() {
                handler(&event);
            }
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(event) => handler(&event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
