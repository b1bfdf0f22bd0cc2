//! Tracing and telemetry initialisation for operator binaries: fmt output
//! filtered by `RUST_LOG`, with an optional Jaeger pipeline.

use opentelemetry::{global, sdk::propagation::TraceContextPropagator, KeyValue};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Parse a `key=value` CLI argument into a trace tag.
pub fn parse_key_value(source: &str) -> Result<KeyValue, String> {
    match source.find('=') {
        Some(equals) => Ok(KeyValue::new(
            source[.. equals].to_string(),
            source[equals + 1 ..].to_string(),
        )),
        None => Err(format!("invalid key=value pair: '{}'", source)),
    }
}

/// The default process tags attached to every span.
pub fn default_tracing_tags(version: &str) -> Vec<KeyValue> {
    vec![KeyValue::new("crate.version", version.to_string())]
}

/// Initialise the global tracing subscriber. When a Jaeger agent endpoint is
/// given, spans are additionally exported there.
pub fn init_tracing(service_name: &str, tracing_tags: Vec<KeyValue>, jaeger: Option<String>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match jaeger {
        Some(jaeger) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let tracer = opentelemetry_jaeger::new_pipeline()
                .with_agent_endpoint(jaeger)
                .with_service_name(service_name)
                .with_tags(tracing_tags)
                .install_batch(opentelemetry::runtime::TokioCurrentThread)
                .expect("jaeger pipeline install failed");
            subscriber
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        None => subscriber.init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs() {
        let tag = parse_key_value("pod.name=operator-0").unwrap();
        assert_eq!(tag.key.as_str(), "pod.name");
        assert!(parse_key_value("no-separator").is_err());
    }
}
