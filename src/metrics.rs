//! Statsd metrics emission.
//!
//! Request states are enqueued non-blocking onto a bounded channel and
//! drained by a single background task, which formats the statsd lines and
//! ships them over UDP, one socket per batch. A full queue drops the record
//! with a warning rather than stalling a request.
//!
//! Line format: `{prefix}.{metric}:{value}|{c|g|ms}\n`.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

use crate::state::{FetchState, RequestState, ResponseState, TileJsonRequestState};

/// Capacity of the queue between handlers and the shipping task.
const MAX_QUEUE_SIZE: usize = 4096;

/// Sink for per-request observability records.
pub trait MetricsWriter: Send + Sync {
    fn write_metatile_state(&self, state: &RequestState);
    fn write_tilejson_state(&self, state: &TileJsonRequestState);
}

/// Metrics writer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NilMetricsWriter;

impl MetricsWriter for NilMetricsWriter {
    fn write_metatile_state(&self, _state: &RequestState) {}
    fn write_tilejson_state(&self, _state: &TileJsonRequestState) {}
}

enum StateContainer {
    Metatile(RequestState),
    TileJson(TileJsonRequestState),
}

/// Statsd writer with a background shipping task.
pub struct StatsdMetricsWriter {
    queue: mpsc::Sender<StateContainer>,
}

impl StatsdMetricsWriter {
    /// Spawn the shipping task. Must be called from within a tokio runtime.
    pub fn new(addr: SocketAddr, prefix: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::channel(MAX_QUEUE_SIZE);
        let prefix = prefix.into();

        tokio::spawn(async move {
            while let Some(container) = rx.recv().await {
                let lines = match &container {
                    StateContainer::Metatile(state) => format_metatile_lines(&prefix, state),
                    StateContainer::TileJson(state) => format_tilejson_lines(&prefix, state),
                };
                if let Err(err) = ship(addr, lines.as_bytes()).await {
                    warn!("failed to ship metrics to {}: {}", addr, err);
                }
            }
        });

        Self { queue: tx }
    }

    fn enqueue(&self, container: StateContainer) {
        if self.queue.try_send(container).is_err() {
            warn!("metrics writer queue full");
        }
    }
}

impl MetricsWriter for StatsdMetricsWriter {
    fn write_metatile_state(&self, state: &RequestState) {
        self.enqueue(StateContainer::Metatile(state.clone()));
    }

    fn write_tilejson_state(&self, state: &TileJsonRequestState) {
        self.enqueue(StateContainer::TileJson(state.clone()));
    }
}

async fn ship(addr: SocketAddr, payload: &[u8]) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(payload, addr).await?;
    Ok(())
}

// =============================================================================
// Line formatting
// =============================================================================

struct StatsdLines {
    prefix: String,
    out: String,
}

impl StatsdLines {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            out: String::new(),
        }
    }

    fn metric_name(&self, metric: &str) -> String {
        if self.prefix.is_empty() {
            metric.to_string()
        } else {
            format!("{}.{}", self.prefix, metric)
        }
    }

    fn count(&mut self, metric: &str, value: i64) {
        self.out
            .push_str(&format!("{}:{}|c\n", self.metric_name(metric), value));
    }

    fn gauge(&mut self, metric: &str, value: u64) {
        self.out
            .push_str(&format!("{}:{}|g\n", self.metric_name(metric), value));
    }

    fn timer(&mut self, metric: &str, value: Duration) {
        self.out.push_str(&format!(
            "{}:{}|ms\n",
            self.metric_name(metric),
            value.as_millis()
        ));
    }

    fn bool_count(&mut self, metric: &str, value: bool) {
        if value {
            self.count(metric, 1);
        }
    }
}

fn write_response_state(lines: &mut StatsdLines, state: ResponseState) {
    if state > ResponseState::Nil {
        lines.count(&format!("responsestate.{}", state.as_str()), 1);
    }
}

fn write_fetch_state(lines: &mut StatsdLines, state: FetchState) {
    if state > FetchState::Nil {
        lines.count(&format!("fetchstate.{}", state.as_str()), 1);
    }
}

fn format_metatile_lines(prefix: &str, state: &RequestState) -> String {
    let mut lines = StatsdLines::new(prefix);

    lines.count("count", 1);
    lines.count("metatile", 1);

    if state.fetch_size.body_size > 0 {
        lines.gauge("fetchsize.body-size", state.fetch_size.body_size);
        lines.gauge("fetchsize.buffer-length", state.fetch_size.bytes_length);
        lines.gauge("fetchsize.buffer-capacity", state.fetch_size.bytes_cap);
    }

    lines.timer("timers.parse", state.duration.parse);
    lines.timer("timers.cache-lookup", state.duration.cache_lookup);
    lines.timer("timers.cache-set", state.duration.cache_set);
    lines.timer("timers.storage-fetch", state.duration.storage_fetch);
    lines.timer("timers.storage-read", state.duration.storage_read);
    lines.timer("timers.metatile-find", state.duration.metatile_find);
    lines.timer("timers.response-write", state.duration.resp_write);
    lines.timer("timers.total", state.duration.total);

    if let Some(format) = &state.format {
        lines.count(&format!("formats.{}", format), 1);
    }
    if state.response_size > 0 {
        lines.gauge("response-size", state.response_size);
    }

    write_response_state(&mut lines, state.response_state);
    write_fetch_state(&mut lines, state.fetch_state);

    lines.bool_count("counts.lastmodified", state.storage_metadata.has_last_modified);
    lines.bool_count("counts.etag", state.storage_metadata.has_etag);
    lines.bool_count("counts.vector-cache-hit", state.cache.vector_cache_hit);
    lines.bool_count(
        "errors.response-write-error",
        state.is_response_write_error,
    );
    lines.bool_count("errors.condition-parse-error", state.is_cond_error);
    lines.bool_count("errors.cache-lookup-error", state.is_cache_lookup_error);
    lines.bool_count("errors.zip-error", state.is_zip_error);

    lines.out
}

fn format_tilejson_lines(prefix: &str, state: &TileJsonRequestState) -> String {
    let mut lines = StatsdLines::new(prefix);

    lines.count("count", 1);
    lines.count("tilejson", 1);

    lines.timer("timers.parse", state.duration.parse);
    lines.timer("timers.storage-fetch", state.duration.storage_fetch);
    // storage read and response write happen in one copy for tilejson
    lines.timer("timers.storage-read", state.duration.storage_read_resp_write);

    if let Some(format) = &state.format {
        lines.count(&format!("tilejson.formats.{}", format.name()), 1);
    }

    lines.gauge("fetchsize.body-size", state.fetch_size);
    lines.gauge("response-size", state.fetch_size);

    write_response_state(&mut lines, state.response_state);
    write_fetch_state(&mut lines, state.fetch_state);

    lines.bool_count("counts.lastmodified", state.storage_metadata.has_last_modified);
    lines.bool_count("counts.etag", state.storage_metadata.has_etag);
    lines.bool_count(
        "errors.response-write-error",
        state.is_response_write_error,
    );
    lines.bool_count("errors.condition-parse-error", state.is_cond_error);

    lines.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CacheData, FetchSize, StageDurations, StorageMetadata};

    #[test]
    fn test_line_format() {
        let mut lines = StatsdLines::new("tapgw");
        lines.count("count", 1);
        lines.gauge("response-size", 42);
        lines.timer("timers.total", Duration::from_millis(17));
        lines.bool_count("counts.etag", false);
        lines.bool_count("counts.lastmodified", true);

        assert_eq!(
            lines.out,
            "tapgw.count:1|c\n\
             tapgw.response-size:42|g\n\
             tapgw.timers.total:17|ms\n\
             tapgw.counts.lastmodified:1|c\n"
        );
    }

    #[test]
    fn test_empty_prefix_omits_dot() {
        let mut lines = StatsdLines::new("");
        lines.count("count", 1);
        assert_eq!(lines.out, "count:1|c\n");
    }

    #[test]
    fn test_metatile_lines() {
        let state = RequestState {
            response_state: ResponseState::Success,
            fetch_state: FetchState::Success,
            fetch_size: FetchSize {
                body_size: 2048,
                bytes_length: 2048,
                bytes_cap: 4096,
            },
            storage_metadata: StorageMetadata {
                has_last_modified: true,
                has_etag: true,
            },
            cache: CacheData {
                vector_cache_hit: true,
                metatile_cache_hit: false,
            },
            format: Some("json".to_string()),
            response_size: 2,
            duration: StageDurations {
                total: Duration::from_millis(5),
                ..Default::default()
            },
            ..Default::default()
        };

        let out = format_metatile_lines("pfx", &state);
        assert!(out.contains("pfx.count:1|c\n"));
        assert!(out.contains("pfx.metatile:1|c\n"));
        assert!(out.contains("pfx.fetchsize.body-size:2048|g\n"));
        assert!(out.contains("pfx.responsestate.ok:1|c\n"));
        assert!(out.contains("pfx.fetchstate.ok:1|c\n"));
        assert!(out.contains("pfx.formats.json:1|c\n"));
        assert!(out.contains("pfx.counts.lastmodified:1|c\n"));
        assert!(out.contains("pfx.counts.etag:1|c\n"));
        assert!(out.contains("pfx.counts.vector-cache-hit:1|c\n"));
        assert!(out.contains("pfx.timers.total:5|ms\n"));
        assert!(!out.contains("errors."));
    }

    #[test]
    fn test_metatile_lines_nil_states_skipped() {
        let state = RequestState::default();
        let out = format_metatile_lines("pfx", &state);
        assert!(!out.contains("responsestate."));
        assert!(!out.contains("fetchstate."));
        assert!(!out.contains("fetchsize."));
    }

    #[test]
    fn test_tilejson_lines() {
        let state = TileJsonRequestState {
            response_state: ResponseState::NotFound,
            fetch_state: FetchState::NotFound,
            fetch_size: 0,
            format: Some(crate::storage::TileJsonFormat::Topojson),
            ..Default::default()
        };

        let out = format_tilejson_lines("pfx", &state);
        assert!(out.contains("pfx.tilejson:1|c\n"));
        assert!(out.contains("pfx.tilejson.formats.topojson:1|c\n"));
        assert!(out.contains("pfx.responsestate.notfound:1|c\n"));
        assert!(out.contains("pfx.fetchstate.notfound:1|c\n"));
    }

    #[tokio::test]
    async fn test_writer_ships_over_udp() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();

        let writer = StatsdMetricsWriter::new(addr, "test");
        let state = RequestState {
            response_state: ResponseState::Success,
            ..Default::default()
        };
        writer.write_metatile_state(&state);

        let mut buf = vec![0u8; 64 * 1024];
        let received = tokio::time::timeout(Duration::from_secs(2), receiver.recv(&mut buf))
            .await
            .expect("timed out waiting for metrics datagram")
            .unwrap();
        let payload = String::from_utf8_lossy(&buf[..received]);
        assert!(payload.contains("test.count:1|c\n"));
        assert!(payload.contains("test.responsestate.ok:1|c\n"));
    }
}
