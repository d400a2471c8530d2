use std::fmt as StdFmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::{TraceContextExt, TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use opentelemetry_sdk::{Resource, trace};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::span::{Attributes, Id, Record};
use tracing::Subscriber;
use tracing_opentelemetry::{OpenTelemetrySpanExt, OtelData};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{self, FmtContext};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::reload;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{AppConfig, TelemetryConfig};

struct TelemetryHandles {
    install_otel: Box<dyn Fn(trace::Tracer) -> Result<(), TelemetryError> + Send + Sync + 'static>,
}

impl TelemetryHandles {
    fn install_tracer(&self, tracer: trace::Tracer) -> Result<(), TelemetryError> {
        (self.install_otel)(tracer)
    }
}

static TELEMETRY_HANDLES: OnceLock<TelemetryHandles> = OnceLock::new();
static GLOBAL_GUARD: OnceLock<Mutex<Option<TelemetryGuard>>> = OnceLock::new();

/// Owns the tracer provider so pending spans are exported on drop.
#[derive(Clone)]
pub struct TelemetryGuard {
    provider: Option<Arc<SdkTracerProvider>>,
    shutdown_on_drop: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if !self.shutdown_on_drop {
            return;
        }
        if let Some(provider) = self.provider.take() {
            if Arc::strong_count(&provider) == 1 {
                let _ = provider.shutdown();
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to set tracing subscriber: {0}")]
    SubscriberInit(String),
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(String),
}

/// Installs `RUST_LOG`-driven logging plus optional OTLP trace export.
/// Pretty stderr output when `app.env` is `dev`, JSON lines otherwise.
/// Calling it again only swaps in a new tracer.
pub fn init_telemetry(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let (tracer, provider) = build_tracer(app, telemetry)?;

    if app.env.eq_ignore_ascii_case("dev") {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .pretty()
            .with_writer(std::io::stderr);
        install_subscriber(fmt_layer, env_filter, tracer)?;
    } else {
        let fmt_layer = fmt::layer().event_format(JsonTraceFormatter);
        install_subscriber(fmt_layer, env_filter, tracer)?;
    }

    Ok(provider
        .map(retain_provider)
        .unwrap_or(TelemetryGuard {
            provider: None,
            shutdown_on_drop: false,
        }))
}

fn build_tracer(
    app: &AppConfig,
    telemetry: &TelemetryConfig,
) -> Result<(Option<trace::Tracer>, Option<Arc<SdkTracerProvider>>), TelemetryError> {
    if !telemetry.export_traces {
        return Ok((None, None));
    }
    let endpoint = match telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) if !endpoint.is_empty() => endpoint,
        _ => return Ok((None, None)),
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_timeout(Duration::from_secs(3))
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::ExporterBuild(err.to_string()))?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", app.service_name.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", app.env.clone()),
        ])
        .build();
    let provider = Arc::new(
        SdkTracerProvider::builder()
            .with_span_processor(BatchSpanProcessor::builder(exporter).build())
            .with_resource(resource)
            .build(),
    );

    global::set_tracer_provider(provider.as_ref().clone());
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let tracer = provider.tracer(app.service_name.clone());
    Ok((Some(tracer), Some(provider)))
}

fn retain_provider(provider: Arc<SdkTracerProvider>) -> TelemetryGuard {
    let slot = GLOBAL_GUARD.get_or_init(|| Mutex::new(None));
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(TelemetryGuard {
        provider: Some(provider.clone()),
        shutdown_on_drop: true,
    });

    TelemetryGuard {
        provider: Some(provider),
        shutdown_on_drop: false,
    }
}

fn install_subscriber(
    fmt_layer: impl Layer<Registry> + Send + Sync + 'static,
    env_filter: EnvFilter,
    tracer: Option<trace::Tracer>,
) -> Result<(), TelemetryError> {
    if let Some(handles) = TELEMETRY_HANDLES.get() {
        if let Some(tracer) = tracer {
            handles.install_tracer(tracer)?;
        }
        return Ok(());
    }

    let (otel_layer, otel_reload) =
        reload::Layer::new(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)));

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(SpanFieldsLayer)
        .with(otel_layer)
        .with(env_filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))?;

    let handles = TelemetryHandles {
        install_otel: Box::new(move |tracer: trace::Tracer| {
            otel_reload
                .modify(|layer| {
                    *layer = Some(tracing_opentelemetry::layer().with_tracer(tracer));
                })
                .map_err(|err| TelemetryError::SubscriberInit(err.to_string()))
        }),
    };
    let _ = TELEMETRY_HANDLES.set(handles);

    Ok(())
}

/// Logging without trace export, for tools and tests that have no config.
pub fn init_logging(env: &str) -> Result<(), TelemetryError> {
    let app = AppConfig {
        service_name: "mailvault".to_string(),
        port: 0,
        env: env.to_string(),
    };
    init_telemetry(&app, &TelemetryConfig::default()).map(|_guard| ())
}

/// Span fields captured as JSON so log lines can carry `run_id` and
/// `provider` from the enclosing sync run.
struct SpanFields(Map<String, Value>);

struct SpanFieldsLayer;

impl<S> Layer<S> for SpanFieldsLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(fields) = extensions.get_mut::<SpanFields>() {
            let mut visitor = JsonVisitor {
                fields: std::mem::take(&mut fields.0),
            };
            values.record(&mut visitor);
            fields.0 = visitor.fields;
        }
    }
}

struct JsonTraceFormatter;

impl<S, N> FormatEvent<S, N> for JsonTraceFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> StdFmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let trace_id = ctx
            .lookup_current()
            .and_then(|span| {
                span.extensions()
                    .get::<OtelData>()
                    .and_then(|data| data.trace_id())
            })
            .or_else(|| {
                let ctx = tracing::Span::current().context();
                let span_ctx = ctx.span().span_context().clone();
                span_ctx.is_valid().then(|| span_ctx.trace_id())
            })
            .map(|id| id.to_string());

        let mut span_fields = Map::new();
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if let Some(fields) = span.extensions().get::<SpanFields>() {
                    span_fields.extend(fields.0.clone());
                }
            }
        }

        let payload = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": event.metadata().level().as_str().to_lowercase(),
            "target": event.metadata().target(),
            "span": ctx.lookup_current().map(|span| span.name().to_string()),
            "run_id": span_fields.get("run_id"),
            "trace_id": trace_id,
            "span_fields": span_fields,
            "fields": visitor.fields,
        });

        let serialized = serde_json::to_string(&payload).map_err(|_| StdFmt::Error)?;
        writer.write_str(&serialized)?;
        writer.write_str("\n")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: Map<String, Value>,
}

impl tracing_subscriber::field::Visit for JsonVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), value.to_string().into());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn StdFmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}").into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::io::{self, Write};

    static INIT_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[derive(Clone)]
    struct BufferWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for BufferWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buf.lock().expect("lock buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(buffer: &Arc<Mutex<Vec<u8>>>) -> impl Fn() -> BufferWriter + 'static {
        let buffer = buffer.clone();
        move || BufferWriter {
            buf: buffer.clone(),
        }
    }

    fn first_line(buffer: &Arc<Mutex<Vec<u8>>>) -> serde_json::Value {
        let output =
            String::from_utf8(buffer.lock().expect("lock buffer").clone()).expect("utf8 output");
        let line = output.lines().next().expect("log line").to_string();
        serde_json::from_str(&line).expect("json line")
    }

    #[test]
    fn telemetry_init_is_idempotent_without_endpoint() {
        let _guard = INIT_GUARD.lock().expect("lock init");
        let app = AppConfig {
            service_name: "mailvault".into(),
            port: 0,
            env: "prod".into(),
        };
        let telemetry = TelemetryConfig {
            otlp_endpoint: None,
            export_traces: true,
        };

        init_telemetry(&app, &telemetry).expect("telemetry initializes without endpoint");
        init_telemetry(&app, &telemetry).expect("second init is a no-op");
    }

    #[test]
    fn json_lines_carry_run_fields_and_trace_id() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let provider = SdkTracerProvider::builder().build();
        let tracer = provider.tracer("test");

        let subscriber = Registry::default()
            .with(
                fmt::layer()
                    .event_format(JsonTraceFormatter)
                    .with_writer(capture(&buffer)),
            )
            .with(SpanFieldsLayer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer));

        let mut recorded_trace_id = None;
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("sync_run", run_id = "run-1", provider = "gmail");
            recorded_trace_id = Some(span.context().span().span_context().trace_id().to_string());
            let _entered = span.enter();
            tracing::info!(message_id = "m1", downloaded = 3u64, "message archived");
        });

        let payload = first_line(&buffer);
        assert_eq!(payload["level"], "info");
        assert_eq!(payload["span"], "sync_run");
        assert_eq!(payload["run_id"], "run-1");
        assert_eq!(payload["span_fields"]["provider"], "gmail");
        assert_eq!(payload["fields"]["message_id"], "m1");
        assert_eq!(payload["fields"]["downloaded"], 3);
        assert_eq!(payload["fields"]["message"], "message archived");
        assert_eq!(
            payload["trace_id"],
            recorded_trace_id.expect("trace id recorded")
        );
    }

    #[test]
    fn late_recorded_span_fields_are_included() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = Registry::default()
            .with(
                fmt::layer()
                    .event_format(JsonTraceFormatter)
                    .with_writer(capture(&buffer)),
            )
            .with(SpanFieldsLayer);

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("sync_run", run_id = "run-2", provider = tracing::field::Empty);
            span.record("provider", "m365");
            let _entered = span.enter();
            tracing::warn!("checkpoint frozen");
        });

        let payload = first_line(&buffer);
        assert_eq!(payload["level"], "warn");
        assert_eq!(payload["span_fields"]["provider"], "m365");
        assert!(payload["trace_id"].is_null());
    }
}
