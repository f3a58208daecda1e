//! Heartbeat bookkeeping for the broker's catalog.
//!
//! A service promises to be heard from every `liveliness` milliseconds and may
//! miss `retries` such intervals in a row. Every roll-call counts the whole
//! intervals that have passed since its last message; once that exceeds the
//! budget the service is dropped from the catalog.

use std::sync::Arc;

use tracing::{Span, info_span, warn};

use crate::catalog::{Catalog, ServiceRecord, Verdict};

/// Judges one record at `now_ms` given the misses counted so far.
pub fn judge(record: &ServiceRecord, misses: u32, now_ms: u64) -> Verdict {
    if record.liveliness == 0 {
        return Verdict::Alive { misses: 0 };
    }

    let elapsed = now_ms.saturating_sub(record.last_beat);
    if elapsed <= record.liveliness {
        return Verdict::Alive { misses: 0 };
    }

    // Whole intervals since the last beat, however often the roll-call runs.
    let intervals = u32::try_from(elapsed / record.liveliness).unwrap_or(u32::MAX);
    let misses = misses.max(intervals);
    if misses > record.retries {
        Verdict::Unreachable
    } else {
        Verdict::Alive { misses }
    }
}

pub struct LivelinessMonitor {
    catalog: Arc<Catalog>,
    span: Span,
}

impl LivelinessMonitor {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            span: info_span!("liveliness"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// One roll-call over the catalog. Returns the services evicted.
    pub fn tick(&self) -> Vec<String> {
        let _entered = self.span.enter();
        let evicted = self.catalog.sweep(judge);
        for name in &evicted {
            warn!(service = %name, "service unreachable, removed from catalog");
        }
        evicted
    }
}
