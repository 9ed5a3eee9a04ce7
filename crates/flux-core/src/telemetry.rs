// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Telemetry sink: an interface the driver calls into at well-defined
//! points, with a no-op default and a best-effort JSONL reference impl.

use crate::ident::LevelId;

/// Observer hooks the driver calls at well-defined points during execution.
///
/// All methods have empty default bodies; implementors override only the
/// events they care about.
pub trait TelemetrySink: Send + Sync {
    /// A node began running for `id`.
    fn node_started(&self, _node: &str, _id: &LevelId) {}
    /// A node finished running for `id`.
    fn node_finished(&self, _node: &str, _id: &LevelId) {}
    /// A serializer-resource conflict was observed (a node had to wait).
    fn conflict(&self, _resource: &str, _node: &str) {}
    /// A flush was observed by a reduction node.
    fn flush_observed(&self, _node: &str, _id: &LevelId) {}
}

/// Discards every event. The default sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {}

#[cfg(feature = "telemetry")]
fn ts_micros() -> u128 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros()
}

#[cfg(feature = "telemetry")]
fn emit(kind: &str, node: &str, id: Option<&LevelId>) {
    use std::io::Write as _;
    let mut out = std::io::stderr().lock();
    match id {
        Some(id) => {
            let _ = write!(
                out,
                r#"{{"timestamp_micros":{},"event":"{}","node":"{}","id":"{}"}}"#,
                ts_micros(),
                kind,
                node,
                id
            );
        }
        None => {
            let _ = write!(
                out,
                r#"{{"timestamp_micros":{},"event":"{}","node":"{}"}}"#,
                ts_micros(),
                kind,
                node
            );
        }
    }
    let _ = out.write_all(b"\n");
}

/// Best-effort JSONL logger on stderr: one line per event, manually
/// formatted to avoid a `serde_json` dependency for this feature-gated
/// debugging path. I/O errors are silently ignored.
#[derive(Clone, Copy, Debug, Default)]
#[cfg(feature = "telemetry")]
pub struct StderrJsonlSink;

#[cfg(feature = "telemetry")]
impl TelemetrySink for StderrJsonlSink {
    fn node_started(&self, node: &str, id: &LevelId) {
        emit("node_started", node, Some(id));
    }

    fn node_finished(&self, node: &str, id: &LevelId) {
        emit("node_finished", node, Some(id));
    }

    fn conflict(&self, resource: &str, node: &str) {
        emit(&format!("conflict:{resource}"), node, None);
    }

    fn flush_observed(&self, node: &str, id: &LevelId) {
        emit("flush_observed", node, Some(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_every_event_without_panicking() {
        let sink = NullTelemetrySink;
        let id = LevelId::root().child("job", 0);
        sink.node_started("job_add", &id);
        sink.node_finished("job_add", &id);
        sink.conflict("R", "job_add");
        sink.flush_observed("job_add", &id);
    }
}
