use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;


lazy_static! {
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_cache_events_received_total", "Events recorded by the watch cache"),
        &["resource_prefix"]
    )
    .expect("metric can not be created");

    pub static ref EVENTS_DISPATCHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_cache_events_dispatched_total", "Events fanned out to cache watchers"),
        &["resource_prefix"]
    )
    .expect("metric can not be created");

    pub static ref TERMINATED_WATCHERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "watch_cache_terminated_watchers_total",
            "Watchers stopped because they could not keep up"
        ),
        &["resource_prefix"]
    )
    .expect("metric can not be created");

    pub static ref INITIALIZATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_cache_initializations_total", "Successful lists seeding the watch cache"),
        &["resource_prefix"]
    )
    .expect("metric can not be created");

    pub static ref BYPASSED_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("watch_cache_bypassed_requests_total", "Requests served by the backing store"),
        &["resource_prefix", "request"]
    )
    .expect("metric can not be created");

    pub static ref REGISTERED_WATCHERS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("watch_cache_registered_watchers", "Cache watchers currently registered"),
        &["resource_prefix"]
    )
    .expect("metric can not be created");

    pub static ref CAPACITY: IntGaugeVec = IntGaugeVec::new(
        Opts::new("watch_cache_capacity", "Current ring buffer capacity"),
        &["resource_prefix"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

pub fn register_custom_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(EVENTS_RECEIVED_TOTAL.clone()))?;
    registry.register(Box::new(EVENTS_DISPATCHED_TOTAL.clone()))?;
    registry.register(Box::new(TERMINATED_WATCHERS_TOTAL.clone()))?;
    registry.register(Box::new(INITIALIZATIONS_TOTAL.clone()))?;
    registry.register(Box::new(BYPASSED_REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(REGISTERED_WATCHERS.clone()))?;
    registry.register(Box::new(CAPACITY.clone()))?;
    Ok(())
}

/// Renders every watch cache metric in the Prometheus text format.
pub fn gather_metrics() -> String {
    REGISTER.call_once(|| {
        if let Err(e) = register_custom_metrics(&REGISTRY) {
            tracing::warn!("failed to register metrics: {:?}", e);
        }
    });

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("failed to encode metrics: {:?}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
