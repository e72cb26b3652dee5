//! Engine-wide event counters.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident,)*) => {
        /// Monotonic event counters, updated with relaxed atomics.
        #[derive(Debug, Default)]
        pub(crate) struct Counters {
            $(pub(crate) $name: AtomicU64,)*
        }

        impl Counters {
            $(
                pub(crate) fn $name(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Copies the current values.
            pub(crate) fn snapshot(&self) -> CountersSnapshot {
                CountersSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub(crate) fn clear(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }

        /// Point-in-time copy of the engine counters.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize))]
        pub struct CountersSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl CountersSnapshot {
            /// `(name, value)` pairs in declaration order.
            pub fn entries(&self) -> Vec<(&'static str, u64)> {
                vec![$((stringify!($name), self.$name),)*]
            }
        }
    };
}

counters! {
    /// Calls that went through a profiling entry point.
    calls_observed,
    /// Calls that failed.
    calls_failed,
    /// Calls rejected because no backend could take them.
    calls_rejected,
    /// Calls moved to a fallback backend.
    calls_rerouted,
    /// Reports suppressed by the deduplication window.
    reports_deduplicated,
    /// Reports built by workers.
    reports_built,
    /// Reports handed to sinks and managers.
    reports_delivered,
    /// Reports lost to a full report queue.
    reports_dropped,
    /// User-visible notifications raised.
    notifications,
    /// Jobs lost to a full job queue.
    jobs_dropped,
    /// Recovery tasks denied by the attempt budget.
    recoveries_throttled,
    /// Recovery tasks lost to a full recovery queue.
    recoveries_dropped,
    /// Recovery tasks executed.
    recoveries_attempted,
    /// Recovery tasks that succeeded.
    recoveries_succeeded,
    /// Recovery tasks that failed.
    recoveries_failed,
    /// Draws executed through a batched path.
    batched_draws,
    /// Batched draws that failed and fell back to a direct call.
    batched_fallbacks,
    /// Call sites evicted from the statistics store.
    keys_evicted,
    /// Monitoring or maintenance cycles that panicked.
    cycle_panics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_and_clears() {
        let counters = Counters::default();
        counters.calls_observed();
        counters.calls_observed();
        counters.reports_dropped();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.calls_observed, 2);
        assert_eq!(snapshot.reports_dropped, 1);
        assert_eq!(snapshot.entries()[0], ("calls_observed", 2));
        counters.clear();
        assert_eq!(counters.snapshot(), CountersSnapshot::default());
    }
}
