//! Pool instruments exported through the global `OpenTelemetry` meter.
//!
//! With the `metrics` feature the instruments are registered on first use
//! against whatever meter provider [`crate::metrics::init_metrics`] installed
//! (a no-op provider if none was). Without the feature every call compiles
//! to nothing.

#[cfg(feature = "metrics")]
mod otel {
    use std::sync::OnceLock;

    use opentelemetry::KeyValue;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Gauge, Histogram};

    pub(super) struct Instruments {
        pub(super) pool_events: Counter<u64>,
        pub(super) pool_size: Gauge<u64>,
        pub(super) conversation_elapsed: Histogram<u64>,
    }

    static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

    pub(super) fn get() -> &'static Instruments {
        INSTRUMENTS.get_or_init(|| {
            let meter = global::meter("warmpool");
            Instruments {
                pool_events: meter
                    .u64_counter("warmpool.pool.events")
                    .with_description("Spawns, assignments, failures and reaps")
                    .build(),
                pool_size: meter
                    .u64_gauge("warmpool.pool.size")
                    .with_description("Idle ready agents in the pool")
                    .build(),
                conversation_elapsed: meter
                    .u64_histogram("warmpool.conversation.elapsed")
                    .with_description("Elapsed time of running conversations")
                    .with_unit("s")
                    .build(),
            }
        })
    }

    pub(super) fn event(name: &'static str) -> [KeyValue; 1] {
        [KeyValue::new("event", name)]
    }
}

/// Count one pool event (`total_spawned`, `total_assigned`, ...).
#[cfg(feature = "metrics")]
pub fn record_pool_event(name: &'static str) {
    otel::get().pool_events.add(1, &otel::event(name));
}

/// Report the current pool size.
#[cfg(feature = "metrics")]
pub fn record_pool_size(size: i64) {
    otel::get()
        .pool_size
        .record(u64::try_from(size).unwrap_or(0), &[]);
}

/// Record one conversation duration sample.
#[cfg(feature = "metrics")]
pub fn record_conversation_elapsed(secs: i64) {
    otel::get()
        .conversation_elapsed
        .record(u64::try_from(secs).unwrap_or(0), &[]);
}

#[cfg(not(feature = "metrics"))]
pub const fn record_pool_event(_name: &'static str) {}

#[cfg(not(feature = "metrics"))]
pub const fn record_pool_size(_size: i64) {}

#[cfg(not(feature = "metrics"))]
pub const fn record_conversation_elapsed(_secs: i64) {}
