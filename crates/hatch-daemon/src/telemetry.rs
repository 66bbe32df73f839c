use std::env;

use anyhow::Result;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    resource::Resource,
    runtime::Tokio,
    trace::{self, Sampler},
};
use tracing::{info, warn, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
    layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter,
};

/// Flushes the OTEL pipeline on drop when an exporter was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_installed: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.tracer_installed {
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the fmt subscriber and, when sampling allows, an OTLP trace
/// exporter configured from the environment. Exporter failures degrade to
/// console logs.
pub fn init(service_name: &str) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (sampling_rate, sampling_warning) =
        parse_sampling_rate(env::var("HATCH_OTEL_SAMPLING_RATE").ok().as_deref());

    let mut guard = TelemetryGuard {
        tracer_installed: false,
    };
    let mut otel_error: Option<anyhow::Error> = None;

    match build_otel_layer(service_name, sampling_rate) {
        Ok(Some(layer)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(layer)
                .init();
            guard.tracer_installed = true;
        }
        Ok(None) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
        Err(error) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            otel_error = Some(error);
        }
    }

    if let Some(message) = sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = otel_error {
        warn!(%error, "failed to initialize OTEL exporter; continuing with console logs only");
    }
    info!(sampling_rate, "telemetry configured");

    Ok(guard)
}

fn build_otel_layer<S>(
    service_name: &str,
    sampling_rate: f64,
) -> Result<Option<OpenTelemetryLayer<S, trace::Tracer>>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    if sampling_rate <= 0.0 {
        return Ok(None);
    }

    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter().tonic();
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .with_exporter(exporter)
        .install_batch(Tokio)?;

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Parses `HATCH_OTEL_SAMPLING_RATE`, clamping out-of-range values and
/// falling back to 1.0 with a warning on garbage.
pub fn parse_sampling_rate(raw: Option<&str>) -> (f64, Option<String>) {
    let Some(value) = raw else {
        return (1.0, None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some("HATCH_OTEL_SAMPLING_RATE is empty; defaulting to 1.0".to_string()),
        );
    }
    match trimmed.parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => (parsed, None),
        Ok(parsed) => {
            let clamped = parsed.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "HATCH_OTEL_SAMPLING_RATE={trimmed} outside 0.0..=1.0; clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "HATCH_OTEL_SAMPLING_RATE='{trimmed}' is not a valid float; defaulting to 1.0"
            )),
        ),
    }
}
