//! Pipeline wiring and lifecycle.
//!
//! Source, parser and sink run as independent tasks joined by two bounded
//! queues; the sampler and the monitor endpoint run alongside them. One
//! cancellation token stops everything, flipped by ctrl-c or by a fatal
//! stage error.

use crate::config::Config;
use crate::monitor::{self, Monitor, QueueDepths};
use crate::parser::{line_preview, AccessLogParser, LogRecord};
use crate::sink::{InfluxSink, RecordSink};
use crate::tailer::{FileSource, LineSource, RawLine};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: &Config) -> Result<()> {
    info!("tailflux starting");

    let cancel_token = CancellationToken::new();
    let monitor = Monitor::new();

    let zone = config.parser.offset()?;
    let target = config.sink.parse_target()?;
    let poll_interval = Duration::from_millis(config.source.poll_interval_ms);

    let (raw_tx, raw_rx) = mpsc::channel::<RawLine>(config.source.queue_capacity);
    let (record_tx, record_rx) = mpsc::channel::<LogRecord>(config.source.queue_capacity);
    let depths = QueueDepths::new(raw_tx.clone(), record_tx.clone());

    let source = FileSource::new(config.source_path(), poll_interval, monitor.clone());
    let parser = AccessLogParser::new(zone);
    let sink: Arc<dyn RecordSink> =
        Arc::new(InfluxSink::new(target, &config.sink, cancel_token.clone())?);

    // Fatal stage failures funnel through here so one task can stop the rest.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(2);

    let mut source_handle = tokio::spawn({
        let cancel_token = cancel_token.clone();
        let fatal_tx = fatal_tx.clone();
        async move {
            if let Err(err) = source.follow(raw_tx, cancel_token).await {
                let _ = fatal_tx.send(err).await;
            }
        }
    });

    let mut parse_handle = tokio::spawn(parse_stage(
        parser,
        raw_rx,
        record_tx,
        monitor.clone(),
        cancel_token.clone(),
    ));

    let mut write_handle = tokio::spawn(write_stage(
        sink,
        record_rx,
        monitor.clone(),
        cancel_token.clone(),
    ));

    let mut sampler_handle = tokio::spawn(monitor::run_sampler(
        monitor.clone(),
        Duration::from_secs(config.monitor.sample_interval_secs),
        cancel_token.clone(),
    ));

    let mut monitor_handle = tokio::spawn({
        let monitor = monitor.clone();
        let depths = depths.clone();
        let cancel_token = cancel_token.clone();
        let fatal_tx = fatal_tx.clone();
        let listen_addr = config.monitor.listen_addr;
        async move {
            if let Err(err) = monitor::serve(listen_addr, monitor, depths, cancel_token).await {
                let _ = fatal_tx.send(err).await;
            }
        }
    });

    info!(
        path = %config.source_path().display(),
        monitor = %config.monitor.listen_addr,
        "tailflux started"
    );

    let mut failure: Option<anyhow::Error> = None;
    tokio::select! {
        maybe_err = fatal_rx.recv() => {
            if let Some(err) = maybe_err {
                error!(error = %err, "pipeline stage failed; shutting down");
                failure = Some(err);
            }
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed while waiting for shutdown signal");
            }
            info!("shutdown signal received");
        }
    }

    cancel_token.cancel();

    join_with_timeout("source", &mut source_handle).await;
    join_with_timeout("parser", &mut parse_handle).await;
    join_with_timeout("writer", &mut write_handle).await;
    join_with_timeout("sampler", &mut sampler_handle).await;
    join_with_timeout("monitor", &mut monitor_handle).await;

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Drains raw lines into parsed records, counting and dropping the ones
/// that do not parse.
pub async fn parse_stage(
    parser: AccessLogParser,
    mut raw_rx: mpsc::Receiver<RawLine>,
    record_tx: mpsc::Sender<LogRecord>,
    monitor: Monitor,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("parse stage cancelled");
                return;
            }
            maybe_line = raw_rx.recv() => {
                let Some(line) = maybe_line else {
                    debug!("line channel closed; parse stage stopping");
                    return;
                };
                match parser.parse(&line) {
                    Ok(record) => {
                        if record_tx.send(record).await.is_err() {
                            debug!("record channel closed; parse stage stopping");
                            return;
                        }
                    }
                    Err(err) => {
                        monitor.parse_error();
                        debug!(
                            error = %err,
                            line = %line_preview(&line, 256),
                            "dropping unparseable line"
                        );
                    }
                }
            }
        }
    }
}

/// Forwards records to the sink one batch at a time; a failed batch is
/// counted and dropped, never fatal.
pub async fn write_stage(
    sink: Arc<dyn RecordSink>,
    mut record_rx: mpsc::Receiver<LogRecord>,
    monitor: Monitor,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("write stage cancelled");
                return;
            }
            maybe_record = record_rx.recv() => {
                let Some(record) = maybe_record else {
                    debug!("record channel closed; write stage stopping");
                    return;
                };
                let batch = [record];
                if let Err(err) = sink.write_batch(&batch).await {
                    monitor.sink_failed(batch.len() as u64);
                    error!(error = %err, "record batch dropped");
                }
            }
        }
    }
}

async fn join_with_timeout(name: &str, handle: &mut JoinHandle<()>) {
    let timeout = sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(timeout);

    let result = tokio::select! {
        res = &mut *handle => Some(res),
        _ = &mut timeout => None,
    };

    match result {
        Some(Ok(())) => debug!(task = name, "stage stopped"),
        Some(Err(err)) => {
            warn!(task = name, error = %err, "stage exited with error during shutdown")
        }
        None => {
            warn!(task = name, "stage did not stop within timeout; aborting");
            handle.abort();
        }
    }
}
