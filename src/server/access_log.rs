use crate::{Method, StatusCode};
use std::{net::SocketAddr, time::Duration};
use tracing::info;

/// Outcome of one answered request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEvent {
    pub client_addr: SocketAddr,
    pub method: Method,
    /// Decoded request path.
    pub path: String,
    pub status: StatusCode,
    /// From the first request byte to the last response byte.
    pub duration: Duration,
}

impl AccessEvent {
    /// Duration in milliseconds, with sub-millisecond precision.
    #[inline]
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Receiver of [`AccessEvent`]s.
///
/// Called on the connection task after the response has been written, so
/// implementations should be quick. Any `Fn(&AccessEvent)` closure is a sink.
///
/// # Examples
/// ```
/// use pico_web::{AccessEvent, Server};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// static ERRORS: AtomicUsize = AtomicUsize::new(0);
///
/// let mut server = Server::new();
/// server.access_log(|event: &AccessEvent| {
///     if event.status.as_u16() >= 500 {
///         ERRORS.fetch_add(1, Ordering::Relaxed);
///     }
/// });
/// ```
pub trait AccessLog: Send + Sync + 'static {
    fn record(&self, event: &AccessEvent);
}

impl<F> AccessLog for F
where
    F: Fn(&AccessEvent) + Send + Sync + 'static,
{
    #[inline]
    fn record(&self, event: &AccessEvent) {
        self(event)
    }
}

/// Default sink: one `info` line per request under the `access` target.
///
/// ```text
/// 192.168.1.20:51234: GET /hello 201 (0.184ms)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, event: &AccessEvent) {
        info!(
            target: "access",
            "{}: {} {} {} ({:.3}ms)",
            event.client_addr,
            event.method,
            event.path,
            event.status.as_u16(),
            event.duration_ms(),
        );
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccessLog;

impl AccessLog for NoAccessLog {
    #[inline]
    fn record(&self, _: &AccessEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let event = AccessEvent {
            client_addr: SocketAddr::from(([10, 0, 0, 2], 5000)),
            method: Method::Get,
            path: "/hello".to_owned(),
            status: StatusCode::Created,
            duration: Duration::from_micros(1500),
        };

        let log: Box<dyn AccessLog> = Box::new({
            let seen = Arc::clone(&seen);
            move |event: &AccessEvent| seen.lock().unwrap().push(event.clone())
        });
        log.record(&event);
        NoAccessLog.record(&event);

        assert_eq!(seen.lock().unwrap().as_slice(), [event.clone()]);
        assert!((event.duration_ms() - 1.5).abs() < 1e-9);
    }
}
