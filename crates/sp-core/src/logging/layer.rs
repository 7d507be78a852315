//! JSONL tracing layer.
//!
//! One JSON object per line on stderr so a host application can ship spool
//! diagnostics alongside its own logs.

use std::io::{self, Write};
use std::sync::Mutex;

use chrono::Utc;
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Pipeline identity carried by the enclosing span.
#[derive(Debug, Clone, Default)]
struct SpanContext {
    feature: Option<String>,
    pipeline_id: Option<String>,
}

/// Collects event fields into a JSON map, keeping `message` apart.
struct JsonFieldVisitor {
    fields: serde_json::Map<String, serde_json::Value>,
    message: Option<String>,
}

impl JsonFieldVisitor {
    fn new() -> Self {
        JsonFieldVisitor {
            fields: serde_json::Map::new(),
            message: None,
        }
    }

    fn insert_string(&mut self, name: &str, value: String) {
        if name == "message" {
            self.message = Some(value);
        } else {
            self.fields
                .insert(name.to_string(), serde_json::Value::String(value));
        }
    }
}

impl tracing::field::Visit for JsonFieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert_string(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.insert_string(field.name(), format!("{:?}", value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

struct SpanContextVisitor {
    context: SpanContext,
}

impl tracing::field::Visit for SpanContextVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "feature" => self.context.feature = Some(value.to_string()),
            "pipeline_id" => self.context.pipeline_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        // `%value` fields arrive here as Display wrappers.
        match field.name() {
            "feature" => self.context.feature = Some(format!("{:?}", value)),
            "pipeline_id" => self.context.pipeline_id = Some(format!("{:?}", value)),
            _ => {}
        }
    }
}

fn level_name(level: &tracing::Level) -> &'static str {
    match *level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

/// JSONL tracing layer that outputs to stderr.
pub struct JsonlLayer<W = io::Stderr> {
    writer: Mutex<W>,
}

impl JsonlLayer<io::Stderr> {
    /// Create a new JSONL layer writing to stderr.
    pub fn stderr() -> Self {
        JsonlLayer {
            writer: Mutex::new(io::stderr()),
        }
    }
}

impl<W: Write> JsonlLayer<W> {
    /// Create a new JSONL layer with a custom writer.
    pub fn new(writer: W) -> Self {
        JsonlLayer {
            writer: Mutex::new(writer),
        }
    }
}

impl<S, W> Layer<S> for JsonlLayer<W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: Write + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = SpanContextVisitor {
            context: SpanContext::default(),
        };
        attrs.record(&mut visitor);

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.context);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let ts = Utc::now();

        // Innermost span wins.
        let mut feature = None;
        let mut pipeline_id = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(span_ctx) = span.extensions().get::<SpanContext>() {
                    if feature.is_none() {
                        feature.clone_from(&span_ctx.feature);
                    }
                    if pipeline_id.is_none() {
                        pipeline_id.clone_from(&span_ctx.pipeline_id);
                    }
                }
            }
        }

        let mut visitor = JsonFieldVisitor::new();
        event.record(&mut visitor);

        let mut obj = serde_json::Map::new();
        obj.insert("ts".to_string(), serde_json::json!(ts.to_rfc3339()));
        obj.insert(
            "level".to_string(),
            serde_json::json!(level_name(event.metadata().level())),
        );
        obj.insert(
            "event".to_string(),
            serde_json::json!(event.metadata().target()),
        );
        if let Some(f) = feature {
            obj.insert("feature".to_string(), serde_json::json!(f));
        }
        if let Some(id) = pipeline_id {
            obj.insert("pipeline_id".to_string(), serde_json::json!(id));
        }
        if let Some(msg) = visitor.message {
            obj.insert("message".to_string(), serde_json::json!(msg));
        }
        if !visitor.fields.is_empty() {
            obj.insert(
                "fields".to_string(),
                serde_json::Value::Object(visitor.fields),
            );
        }

        let json = serde_json::to_string(&serde_json::Value::Object(obj)).unwrap_or_default();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", json);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    struct BufWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for BufWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<serde_json::Value> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let layer = JsonlLayer::new(BufWriter(buffer.clone()));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, f);

        let output = buffer.lock().unwrap();
        String::from_utf8_lossy(&output)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_jsonl_layer_output() {
        let lines = capture(|| {
            tracing::info!(target: "sp_storage::writer", message = "batch written");
        });
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[0]["event"], "sp_storage::writer");
        assert_eq!(lines[0]["message"], "batch written");
        assert!(lines[0]["ts"].is_string());
        assert!(lines[0].get("fields").is_none());
    }

    #[test]
    fn layer_records_typed_fields() {
        let lines = capture(|| {
            tracing::warn!(bytes = 42u64, delta = -3i64, retried = true, path = %"/tmp/x", "dropped");
        });
        assert_eq!(lines[0]["level"], "warn");
        assert_eq!(lines[0]["message"], "dropped");
        assert_eq!(lines[0]["fields"]["bytes"], 42);
        assert_eq!(lines[0]["fields"]["delta"], -3);
        assert_eq!(lines[0]["fields"]["retried"], true);
        assert_eq!(lines[0]["fields"]["path"], "/tmp/x");
    }

    #[test]
    fn layer_attaches_pipeline_span_context() {
        let lines = capture(|| {
            let span = tracing::info_span!("pipeline", feature = "logs", pipeline_id = %"sp-0123");
            let _guard = span.enter();
            tracing::error!("upload failed");
        });
        assert_eq!(lines[0]["level"], "error");
        assert_eq!(lines[0]["feature"], "logs");
        assert_eq!(lines[0]["pipeline_id"], "sp-0123");
    }

    #[test]
    fn events_outside_spans_have_no_context() {
        let lines = capture(|| tracing::debug!("idle"));
        assert!(lines[0].get("feature").is_none());
        assert!(lines[0].get("pipeline_id").is_none());
    }
}
