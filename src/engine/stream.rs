// Veera Core Engine — Stream Accumulator
// Folds the remote client's partial-response events into the evolving
// "full text + citations so far" snapshot the display pacer reveals.
//
// Key properties:
//   - Event text is CUMULATIVE. Each event carries the full text-so-far
//     and replaces the snapshot text outright — never append. A client
//     emitting deltas instead would silently truncate (see the tests).
//   - Citations dedup by literal (title, uri) equality, first-seen order.
//   - A snapshot is produced on every event, even when nothing changed,
//     so the pacer always has a current target.
//   - Incomplete citation records are skipped, never fatal.

use crate::engine::types::{StreamEvent, StreamSnapshot};
use log::debug;

#[derive(Debug, Default)]
pub struct StreamAccumulator {
    snapshot: StreamSnapshot,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        StreamAccumulator { snapshot: StreamSnapshot::default() }
    }

    /// Apply one event and return the updated snapshot.
    ///
    /// The text is installed as-is even when shorter than what came
    /// before; shrink handling (clamping the visible prefix) is the
    /// pacer's concern, not the accumulator's.
    pub fn advance(&mut self, event: StreamEvent) -> &StreamSnapshot {
        self.snapshot.text = event.text;

        for record in event.sources {
            if record.title.is_empty() || record.uri.is_empty() {
                debug!("[stream] Skipping incomplete citation record: {:?}", record);
                continue;
            }
            if !self.snapshot.sources.iter().any(|s| *s == record) {
                self.snapshot.sources.push(record);
            }
        }

        &self.snapshot
    }

    pub fn snapshot(&self) -> &StreamSnapshot {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::GroundingSource;

    fn src(title: &str, uri: &str) -> GroundingSource {
        GroundingSource::new(title, uri)
    }

    #[test]
    fn test_cumulative_text_replaces() {
        let mut acc = StreamAccumulator::new();
        for (event_text, expected) in [("H", "H"), ("He", "He"), ("Hello", "Hello")] {
            let snap = acc.advance(StreamEvent::text(event_text));
            assert_eq!(snap.text, expected);
        }
        assert_eq!(acc.snapshot().text, "Hello");
    }

    #[test]
    fn test_delta_emitter_would_truncate() {
        // The same reply sent as deltas ends up as the last delta alone —
        // this is the duplication/truncation bug the cumulative convention
        // exists to avoid, pinned here so it stays visible.
        let mut acc = StreamAccumulator::new();
        for delta in ["H", "e", "llo"] {
            acc.advance(StreamEvent::text(delta));
        }
        assert_eq!(acc.snapshot().text, "llo");
    }

    #[test]
    fn test_snapshot_produced_when_text_unchanged() {
        let mut acc = StreamAccumulator::new();
        acc.advance(StreamEvent::text("same"));
        let snap = acc.advance(StreamEvent::text("same")).clone();
        assert_eq!(snap.text, "same");
        assert!(snap.sources.is_empty());
    }

    #[test]
    fn test_shorter_text_installs_as_is() {
        let mut acc = StreamAccumulator::new();
        acc.advance(StreamEvent::text("Hello there"));
        let snap = acc.advance(StreamEvent::text("Hi"));
        assert_eq!(snap.text, "Hi");
    }

    #[test]
    fn test_citation_dedup_across_events() {
        let mut acc = StreamAccumulator::new();
        acc.advance(StreamEvent::with_sources("a", vec![src("A", "x")]));
        let snap = acc.advance(StreamEvent::with_sources(
            "ab",
            vec![src("A", "x"), src("B", "y")],
        ));
        assert_eq!(snap.sources, vec![src("A", "x"), src("B", "y")]);
    }

    #[test]
    fn test_citation_first_seen_order() {
        let mut acc = StreamAccumulator::new();
        acc.advance(StreamEvent::with_sources("a", vec![src("B", "y"), src("A", "x")]));
        let snap = acc.advance(StreamEvent::with_sources(
            "ab",
            vec![src("A", "x"), src("C", "z")],
        ));
        let titles: Vec<&str> = snap.sources.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_same_title_different_uri_kept_separately() {
        let mut acc = StreamAccumulator::new();
        let snap = acc.advance(StreamEvent::with_sources(
            "a",
            vec![src("A", "x"), src("A", "y")],
        ));
        assert_eq!(snap.sources.len(), 2);
    }

    #[test]
    fn test_incomplete_citations_skipped() {
        let mut acc = StreamAccumulator::new();
        let snap = acc.advance(StreamEvent::with_sources(
            "a",
            vec![src("", "x"), src("A", ""), src("A", "x")],
        ));
        assert_eq!(snap.sources, vec![src("A", "x")]);
    }

    #[test]
    fn test_duplicate_within_single_event() {
        let mut acc = StreamAccumulator::new();
        let snap = acc.advance(StreamEvent::with_sources(
            "a",
            vec![src("A", "x"), src("A", "x")],
        ));
        assert_eq!(snap.sources.len(), 1);
    }
}
