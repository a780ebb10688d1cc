//! Counter names and recording helpers.
//!
//! The library only emits; installing an exporter is up to the process that
//! embeds it.

use crate::types::CacheSource;

pub const CACHE_READS: &str = "raid_cache_reads_total";
pub const BACKEND_ERRORS: &str = "raid_cache_backend_errors_total";
pub const INVALIDATIONS: &str = "raid_cache_invalidations_total";
pub const EVENTS_PUBLISHED: &str = "raid_cache_events_published_total";
pub const EVENTS_DROPPED: &str = "raid_cache_events_dropped_total";

pub fn record_read(source: CacheSource) {
    metrics::counter!(CACHE_READS, "source" => source.to_string()).increment(1);
}

pub fn record_backend_error(op: &'static str) {
    metrics::counter!(BACKEND_ERRORS, "op" => op).increment(1);
}

pub fn record_invalidation(entity: &'static str) {
    metrics::counter!(INVALIDATIONS, "entity" => entity).increment(1);
}

pub fn record_published(channel: &str) {
    metrics::counter!(EVENTS_PUBLISHED, "channel" => channel.to_string()).increment(1);
}

pub fn record_dropped(channel: &str, reason: &'static str) {
    metrics::counter!(EVENTS_DROPPED, "channel" => channel.to_string(), "reason" => reason)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_reads_are_labelled_by_source() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_read(CacheSource::PositiveCache);
            record_read(CacheSource::PositiveCache);
            record_read(CacheSource::NoCache);
        });

        let mut counts: Vec<(String, u64)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == CACHE_READS)
            .filter_map(|(key, _, _, value)| {
                let source = key
                    .key()
                    .labels()
                    .find(|label| label.key() == "source")?
                    .value()
                    .to_string();
                match value {
                    DebugValue::Counter(n) => Some((source, n)),
                    _ => None,
                }
            })
            .collect();
        counts.sort();

        assert_eq!(
            counts,
            vec![
                ("no_cache".to_string(), 1),
                ("positive_cache".to_string(), 2)
            ]
        );
    }
}
