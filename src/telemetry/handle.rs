use super::events::GatewayEvent;
use super::sinks::{emit_best_effort, MemorySink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
enum Route {
    Disabled,
    Channel(mpsc::Sender<GatewayEvent>),
    Memory(MemorySink),
}

/// Cheap, cloneable emitter shared by every pipeline stage and breaker.
///
/// `emit` never blocks and never awaits: events go through a bounded channel to a worker task
/// that drives the sink. When the channel is full the event is dropped and counted.
#[derive(Clone, Debug)]
pub struct Telemetry {
    route: Route,
    dropped: Arc<AtomicU64>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::disabled()
    }
}

impl Telemetry {
    /// Discard everything.
    pub fn disabled() -> Self {
        Self { route: Route::Disabled, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Spawn a worker that forwards events to `sink`.
    ///
    /// Must be called from inside a tokio runtime; outside one, telemetry is disabled and a
    /// warning is logged.
    pub fn spawn<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<GatewayEvent, Response = ()> + Send + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime; gateway telemetry disabled");
            return Self::disabled();
        };
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                emit_best_effort(sink.clone(), event).await;
            }
        });
        Self { route: Route::Channel(tx), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Record straight into `sink` on the caller's task. For tests.
    pub fn recording(sink: MemorySink) -> Self {
        Self { route: Route::Memory(sink), dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn emit(&self, event: GatewayEvent) {
        match &self.route {
            Route::Disabled => {}
            Route::Channel(tx) => {
                if tx.try_send(event).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Route::Memory(sink) => sink.record(event),
        }
    }

    /// Events lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.route, Route::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::TimeoutEvent;
    use crate::telemetry::NullSink;
    use std::time::Duration;

    fn event() -> GatewayEvent {
        GatewayEvent::Timeout(TimeoutEvent { route: "r".into(), timeout: Duration::from_secs(1) })
    }

    #[test]
    fn recording_is_synchronous() {
        let sink = MemorySink::new();
        let telemetry = Telemetry::recording(sink.clone());
        telemetry.emit(event());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn null_sink_worker_discards() {
        let telemetry = Telemetry::spawn(NullSink, 4);
        assert!(telemetry.is_enabled());
        telemetry.emit(event());
        assert_eq!(telemetry.dropped(), 0);
    }

    #[test]
    fn spawn_outside_runtime_disables() {
        let telemetry = Telemetry::spawn(MemorySink::new(), 4);
        assert!(!telemetry.is_enabled());
        telemetry.emit(event());
        assert_eq!(telemetry.dropped(), 0);
    }

    #[tokio::test]
    async fn worker_forwards_to_sink() {
        let sink = MemorySink::new();
        let telemetry = Telemetry::spawn(sink.clone(), 8);
        telemetry.emit(event());
        for _ in 0..50 {
            if sink.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn full_channel_counts_drops() {
        // current-thread runtime: the worker cannot drain until we yield
        let telemetry = Telemetry::spawn(MemorySink::new(), 1);
        telemetry.emit(event());
        telemetry.emit(event());
        telemetry.emit(event());
        assert_eq!(telemetry.dropped(), 2);
    }
}
