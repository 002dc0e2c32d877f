use crate::parser::LogRecord;
use crate::tailer::RawLine;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health counters shared across pipeline stages.
///
/// Every stage holds a clone; increments are single atomic adds so the hot
/// path never awaits. Derived values (throughput) are published by the
/// sampler task and read back on demand.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    started_at: Instant,

    /// Lines pulled off the source, including ones that later fail to parse.
    lines_handled: AtomicU64,

    /// Lines dropped by the parser.
    parse_errors: AtomicU64,

    /// Records dropped after the sink gave up on them.
    sink_errors: AtomicU64,

    /// Latest sampled throughput, stored as `f64::to_bits`.
    tps_bits: AtomicU64,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                started_at: Instant::now(),
                lines_handled: AtomicU64::new(0),
                parse_errors: AtomicU64::new(0),
                sink_errors: AtomicU64::new(0),
                tps_bits: AtomicU64::new(0),
            }),
        }
    }

    pub fn line_handled(&self) {
        self.inner.lines_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.inner.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sink_failed(&self, records: u64) {
        self.inner.sink_errors.fetch_add(records, Ordering::Relaxed);
    }

    pub fn lines_handled(&self) -> u64 {
        self.inner.lines_handled.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.inner.parse_errors.load(Ordering::Relaxed)
    }

    pub fn sink_errors(&self) -> u64 {
        self.inner.sink_errors.load(Ordering::Relaxed)
    }

    pub fn publish_tps(&self, tps: f64) {
        self.inner.tps_bits.store(tps.to_bits(), Ordering::Relaxed);
    }

    pub fn tps(&self) -> f64 {
        f64::from_bits(self.inner.tps_bits.load(Ordering::Relaxed))
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn snapshot(&self, depths: &QueueDepths) -> MetricsSnapshot {
        MetricsSnapshot {
            handle_line: self.lines_handled(),
            tps: self.tps(),
            read_chan_len: depths.read_chan_len(),
            write_chan_len: depths.write_chan_len(),
            run_time: format_uptime(self.uptime()),
            err_num: self.parse_errors(),
            sink_err_num: self.sink_errors(),
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Live view of the two pipeline queues, read straight off their bounded
/// senders.
#[derive(Clone)]
pub struct QueueDepths {
    raw_lines: mpsc::Sender<RawLine>,
    records: mpsc::Sender<LogRecord>,
}

impl QueueDepths {
    pub fn new(raw_lines: mpsc::Sender<RawLine>, records: mpsc::Sender<LogRecord>) -> Self {
        Self { raw_lines, records }
    }

    pub fn read_chan_len(&self) -> usize {
        self.raw_lines.max_capacity() - self.raw_lines.capacity()
    }

    pub fn write_chan_len(&self) -> usize {
        self.records.max_capacity() - self.records.capacity()
    }
}

/// Point-in-time health document served from the monitor endpoint.
///
/// Field spellings are the wire contract; dashboards key on them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub handle_line: u64,
    pub tps: f64,
    pub read_chan_len: usize,
    pub write_chan_len: usize,
    pub run_time: String,
    pub err_num: u64,
    pub sink_err_num: u64,
}

fn format_uptime(uptime: Duration) -> String {
    humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()
}

/// Throughput over the gap between the two most recent counter samples.
struct ThroughputWindow {
    interval_secs: f64,
    previous: Option<u64>,
}

impl ThroughputWindow {
    fn new(sample_interval: Duration) -> Self {
        Self {
            interval_secs: sample_interval.as_secs_f64(),
            previous: None,
        }
    }

    /// Records a cumulative total; yields a rate once two samples exist.
    fn observe(&mut self, total: u64) -> Option<f64> {
        let rate = self
            .previous
            .map(|previous| total.saturating_sub(previous) as f64 / self.interval_secs);
        self.previous = Some(total);
        rate
    }
}

/// Periodically derives lines-per-second from the running line counter.
pub async fn run_sampler(
    monitor: Monitor,
    sample_interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window = ThroughputWindow::new(sample_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("throughput sampler shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Some(tps) = window.observe(monitor.lines_handled()) {
                    monitor.publish_tps(tps);
                }
            }
        }
    }
}

/// Serves the health snapshot as JSON on `GET /monitor` until cancelled.
pub async fn serve(
    listen_addr: SocketAddr,
    monitor: Monitor,
    depths: QueueDepths,
    cancel_token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind monitor endpoint on {listen_addr}"))?;

    info!("monitor endpoint listening on http://{listen_addr}/monitor");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("monitor endpoint shutting down");
                return Ok(());
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept monitor connection");
                        continue;
                    }
                };

                let monitor = monitor.clone();
                let depths = depths.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req: Request<Incoming>| {
                        let monitor = monitor.clone();
                        let depths = depths.clone();
                        async move { Ok::<_, hyper::Error>(handle_request(&req, &monitor, &depths)) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving monitor connection");
                    }
                });
            }
        }
    }
}

fn handle_request<B>(
    req: &Request<B>,
    monitor: &Monitor,
    depths: &QueueDepths,
) -> Response<Full<Bytes>> {
    if req.method() == Method::GET && req.uri().path() == "/monitor" {
        let snapshot = monitor.snapshot(depths);
        let body = serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string());
        Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_depths() -> QueueDepths {
        let (raw_tx, _raw_rx) = mpsc::channel::<RawLine>(4);
        let (record_tx, _record_rx) = mpsc::channel::<LogRecord>(4);
        QueueDepths::new(raw_tx, record_tx)
    }

    #[test]
    fn fresh_snapshot_reports_zero_counters() {
        let monitor = Monitor::default();
        let snapshot = monitor.snapshot(&empty_depths());

        assert_eq!(snapshot.handle_line, 0);
        assert_eq!(snapshot.err_num, 0);
        assert_eq!(snapshot.sink_err_num, 0);
        assert_eq!(snapshot.tps, 0.0);
        assert_eq!(snapshot.read_chan_len, 0);
        assert_eq!(snapshot.write_chan_len, 0);
        assert_eq!(snapshot.run_time, "0s");
    }

    #[test]
    fn counters_accumulate_monotonically() {
        let monitor = Monitor::new();
        monitor.line_handled();
        monitor.line_handled();
        monitor.line_handled();
        monitor.parse_error();
        monitor.sink_failed(2);

        assert_eq!(monitor.lines_handled(), 3);
        assert_eq!(monitor.parse_errors(), 1);
        assert_eq!(monitor.sink_errors(), 2);

        monitor.line_handled();
        assert_eq!(monitor.lines_handled(), 4);
    }

    #[test]
    fn window_reports_rate_after_two_samples() {
        let mut window = ThroughputWindow::new(Duration::from_secs(5));
        assert_eq!(window.observe(100), None);
        assert_eq!(window.observe(130), Some(6.0));
        assert_eq!(window.observe(130), Some(0.0));
    }

    #[test]
    fn window_never_goes_negative_on_counter_reset() {
        let mut window = ThroughputWindow::new(Duration::from_secs(5));
        window.observe(50);
        assert_eq!(window.observe(10), Some(0.0));
    }

    #[test]
    fn published_tps_round_trips_through_bits() {
        let monitor = Monitor::new();
        monitor.publish_tps(6.25);
        assert_eq!(monitor.tps(), 6.25);
    }

    #[test]
    fn snapshot_serializes_with_wire_field_names() {
        let monitor = Monitor::new();
        let value = serde_json::to_value(monitor.snapshot(&empty_depths())).unwrap();
        let object = value.as_object().unwrap();

        for key in [
            "handleLine",
            "tps",
            "readChanLen",
            "writeChanLen",
            "runTime",
            "errNum",
            "sinkErrNum",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }
    }

    #[test]
    fn queue_depths_track_buffered_items() {
        let (raw_tx, mut raw_rx) = mpsc::channel::<RawLine>(4);
        let (record_tx, _record_rx) = mpsc::channel::<LogRecord>(4);
        let depths = QueueDepths::new(raw_tx.clone(), record_tx);

        raw_tx.try_send(b"one".to_vec()).unwrap();
        raw_tx.try_send(b"two".to_vec()).unwrap();
        assert_eq!(depths.read_chan_len(), 2);
        assert_eq!(depths.write_chan_len(), 0);

        raw_rx.try_recv().unwrap();
        assert_eq!(depths.read_chan_len(), 1);
    }

    #[test]
    fn uptime_formats_whole_seconds() {
        assert_eq!(format_uptime(Duration::from_millis(450)), "0s");
        assert_eq!(format_uptime(Duration::from_secs(65)), "1m 5s");
    }

    #[tokio::test]
    async fn monitor_route_answers_with_json_snapshot() {
        use http_body_util::BodyExt;

        let monitor = Monitor::new();
        let request = Request::builder()
            .method(Method::GET)
            .uri("/monitor")
            .body(())
            .unwrap();

        let response = handle_request(&request, &monitor, &empty_depths());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains('\n'), "body should be pretty-printed");

        let body: serde_json::Value = serde_json::from_str(text).unwrap();
        for key in [
            "handleLine",
            "tps",
            "readChanLen",
            "writeChanLen",
            "runTime",
            "errNum",
            "sinkErrNum",
        ] {
            assert!(body.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(body["handleLine"], 0);
        assert_eq!(body["errNum"], 0);
        assert_eq!(body["tps"], 0.0);
    }

    #[test]
    fn non_monitor_requests_answer_not_found() {
        let monitor = Monitor::new();
        let depths = empty_depths();

        let request = Request::builder().uri("/metrics").body(()).unwrap();
        let response = handle_request(&request, &monitor, &depths);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/monitor")
            .body(())
            .unwrap();
        let response = handle_request(&request, &monitor, &depths);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_snapshot_over_loopback_until_cancelled() {
        let monitor = Monitor::new();
        monitor.line_handled();
        monitor.line_handled();
        monitor.parse_error();
        monitor.publish_tps(4.5);

        let listen_addr: SocketAddr = "127.0.0.1:39193".parse().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listen_addr,
            monitor,
            empty_depths(),
            cancel.clone(),
        ));

        // Let the listener come up before connecting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = reqwest::get(format!("http://{listen_addr}/monitor"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body: serde_json::Value =
            serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body["handleLine"], 2);
        assert_eq!(body["errNum"], 1);
        assert_eq!(body["sinkErrNum"], 0);
        assert_eq!(body["tps"], 4.5);
        assert!(body["runTime"].is_string());

        let missing = reqwest::get(format!("http://{listen_addr}/healthz"))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
