//! CountingEngine - Line Crossing Detection
//!
//! ## Responsibilities
//!
//! - Maintain per-track state (position, side of line, bbox area, age)
//! - Turn track observations into deduplicated, direction-qualified
//!   crossing events
//! - Import per-person counted directions from the Re-ID gallery so a
//!   person who disappears and returns is not double-counted
//! - Evict stale tracks on a timed cleanup pass
//!
//! The engine is owned by the CV worker task; it is single-writer by
//! construction and holds no locks. All age arithmetic uses a monotonic
//! `Duration` supplied by the caller, never the wall clock.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::detector::Observation;
use crate::reid::PersonGallery;

/// Which side of the vertical counting line a center point is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Counted flow direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from physical crossing direction to IN/OUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DirectionMapping {
    /// Left-to-right crossings count as IN.
    #[serde(rename = "L->R")]
    #[default]
    LeftToRightIn,
    /// Right-to-left crossings count as IN.
    #[serde(rename = "R->L")]
    RightToLeftIn,
}

impl DirectionMapping {
    fn map(&self, from: Side, to: Side) -> Direction {
        debug_assert_ne!(from, to);
        let left_to_right = from == Side::Left && to == Side::Right;
        match self {
            DirectionMapping::LeftToRightIn => {
                if left_to_right {
                    Direction::In
                } else {
                    Direction::Out
                }
            }
            DirectionMapping::RightToLeftIn => {
                if left_to_right {
                    Direction::Out
                } else {
                    Direction::In
                }
            }
        }
    }
}

/// Set of directions already counted for a track or person.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountedDirections {
    pub in_counted: bool,
    pub out_counted: bool,
}

impl CountedDirections {
    pub fn contains(&self, dir: Direction) -> bool {
        match dir {
            Direction::In => self.in_counted,
            Direction::Out => self.out_counted,
        }
    }

    pub fn insert(&mut self, dir: Direction) {
        match dir {
            Direction::In => self.in_counted = true,
            Direction::Out => self.out_counted = true,
        }
    }

    pub fn merge(&mut self, other: CountedDirections) {
        self.in_counted |= other.in_counted;
        self.out_counted |= other.out_counted;
    }
}

/// Volatile state for one tracked person. Lives only while the track is
/// active; destroyed by cleanup once the track has not been seen for
/// `max_age`.
#[derive(Debug, Clone)]
pub struct TrackState {
    pub track_id: i64,
    pub last_center: (f32, f32),
    pub last_side: Side,
    pub last_bbox_area: f32,
    pub counted: CountedDirections,
    pub last_seen: Duration,
    pub person_id: Option<String>,
}

/// Engine tuning. Assembled from the active camera settings row.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// X coordinate of the vertical counting line, pixels from the left.
    pub line_x: f32,
    /// Minimum distance from the line for a side change to qualify.
    pub hysteresis_px: f32,
    /// Minimum relative bbox-area change since the last observation.
    /// 0.0 disables the gate.
    pub area_change_threshold: f32,
    pub direction_in: DirectionMapping,
    /// Tracks unseen for longer than this are evicted.
    pub max_age: Duration,
    /// Cleanup runs at most once per this interval.
    pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            line_x: 480.0,
            hysteresis_px: 5.0,
            area_change_threshold: 0.0,
            direction_in: DirectionMapping::LeftToRightIn,
            max_age: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

/// Read-only counter snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CounterStats {
    pub in_count: u64,
    pub out_count: u64,
    pub active_tracks: usize,
}

/// A promoted crossing, before persistence assigns it an id.
#[derive(Debug, Clone)]
pub struct Crossing {
    pub track_id: i64,
    pub person_id: Option<String>,
    pub direction: Direction,
}

/// The counting engine. One instance per CV worker.
pub struct CountingEngine {
    config: EngineConfig,
    tracks: HashMap<i64, TrackState>,
    in_count: u64,
    out_count: u64,
    last_cleanup: Duration,
}

impl CountingEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            in_count: 0,
            out_count: 0,
            last_cleanup: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Move the counting line. Track side assignments refresh on the next
    /// observation of each track.
    pub fn set_line_x(&mut self, line_x: f32) {
        self.config.line_x = line_x;
    }

    /// Swap in new tuning, preserving counters and live tracks. Used by
    /// hot reconfiguration when no reset was requested.
    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    fn side_of(&self, cx: f32) -> Side {
        if cx < self.config.line_x {
            Side::Left
        } else {
            Side::Right
        }
    }

    /// Process one observation. Returns the promoted crossing, if any.
    ///
    /// When `gallery` is present and the track is new, the engine asks it
    /// for a match on `embedding` and imports that person's already-counted
    /// directions. A direction counted for the person since the last reset
    /// suppresses the event even on a brand-new track.
    pub fn observe(
        &mut self,
        obs: &Observation,
        embedding: Option<&[f32]>,
        gallery: Option<&mut PersonGallery>,
        now: Duration,
    ) -> Option<Crossing> {
        let (x1, y1, x2, y2) = obs.bbox;
        if !(x2 > x1 && y2 > y1) || !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            tracing::debug!(track_id = obs.track_id, bbox = ?obs.bbox, "Dropping malformed bbox");
            return None;
        }

        let cx = (x1 + x2) / 2.0;
        let cy = (y1 + y2) / 2.0;
        let area = (x2 - x1) * (y2 - y1);
        let side = self.side_of(cx);

        if !self.tracks.contains_key(&obs.track_id) {
            let mut counted = CountedDirections::default();
            let mut person_id = None;

            // First sighting of this track id: link it to the gallery so
            // counts survive the disappearance of the previous track.
            if let (Some(gallery), Some(embedding)) = (gallery, embedding) {
                let pid = gallery.match_or_register(embedding, obs.track_id);
                counted.merge(gallery.counted_directions(&pid));
                tracing::debug!(
                    track_id = obs.track_id,
                    person_id = %pid,
                    imported_in = counted.in_counted,
                    imported_out = counted.out_counted,
                    "Track linked to gallery person"
                );
                person_id = Some(pid);
            }

            self.tracks.insert(
                obs.track_id,
                TrackState {
                    track_id: obs.track_id,
                    last_center: (cx, cy),
                    last_side: side,
                    last_bbox_area: area,
                    counted,
                    last_seen: now,
                    person_id,
                },
            );
            return None;
        }

        let track = self.tracks.get_mut(&obs.track_id).expect("track exists");
        let mut promoted = None;

        if side != track.last_side {
            let distance_ok = (cx - self.config.line_x).abs() >= self.config.hysteresis_px;
            let area_delta = (area - track.last_bbox_area).abs() / track.last_bbox_area.max(1.0);
            let movement_ok = area_delta >= self.config.area_change_threshold;
            let direction = self.config.direction_in.map(track.last_side, side);

            let person_counted = match (track.person_id.as_ref(), gallery.as_ref()) {
                (Some(pid), Some(g)) => g.counted_directions(pid).contains(direction),
                _ => false,
            };

            if distance_ok && movement_ok && !track.counted.contains(direction) && !person_counted {
                track.counted.insert(direction);
                match direction {
                    Direction::In => self.in_count += 1,
                    Direction::Out => self.out_count += 1,
                }
                if let (Some(pid), Some(g)) = (track.person_id.as_ref(), gallery) {
                    g.mark_counted(pid, direction);
                }
                tracing::info!(
                    track_id = obs.track_id,
                    person_id = ?track.person_id,
                    direction = %direction,
                    cx = cx,
                    "Crossing counted"
                );
                promoted = Some(Crossing {
                    track_id: obs.track_id,
                    person_id: track.person_id.clone(),
                    direction,
                });
            }
        }

        track.last_center = (cx, cy);
        track.last_side = side;
        track.last_bbox_area = area;
        track.last_seen = now;

        promoted
    }

    /// Evict tracks unseen for longer than `max_age`. Runs at most once per
    /// `cleanup_interval`; cheap to call every frame.
    pub fn maybe_cleanup(&mut self, now: Duration) {
        if now.saturating_sub(self.last_cleanup) < self.config.cleanup_interval {
            return;
        }
        self.last_cleanup = now;

        let max_age = self.config.max_age;
        let before = self.tracks.len();
        self.tracks.retain(|_, t| now.saturating_sub(t.last_seen) <= max_age);
        let evicted = before - self.tracks.len();
        if evicted > 0 {
            tracing::debug!(evicted = evicted, active = self.tracks.len(), "Stale tracks evicted");
        }
    }

    /// Zero the counters and drop all track state. Stored events are not
    /// touched; gallery clearing is the caller's decision.
    pub fn reset(&mut self) {
        self.in_count = 0;
        self.out_count = 0;
        self.tracks.clear();
        tracing::info!("Counters reset");
    }

    pub fn stats(&self) -> CounterStats {
        CounterStats {
            in_count: self.in_count,
            out_count: self.out_count,
            active_tracks: self.tracks.len(),
        }
    }

    /// True while the engine has never seen this track id.
    pub fn is_new_track(&self, track_id: i64) -> bool {
        !self.tracks.contains_key(&track_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(track_id: i64, cx: f32, area: f32) -> Observation {
        let half_w = 25.0;
        let h = area / (half_w * 2.0);
        Observation {
            track_id,
            bbox: (cx - half_w, 100.0, cx + half_w, 100.0 + h),
            confidence: 0.9,
        }
    }

    fn engine(line_x: f32, hysteresis: f32, area_threshold: f32) -> CountingEngine {
        CountingEngine::new(EngineConfig {
            line_x,
            hysteresis_px: hysteresis,
            area_change_threshold: area_threshold,
            ..EngineConfig::default()
        })
    }

    fn t(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn single_left_to_right_crossing_counts_as_in() {
        let mut e = engine(400.0, 5.0, 0.0);
        let mut events = Vec::new();
        for (i, cx) in [100.0, 300.0, 500.0, 700.0].into_iter().enumerate() {
            if let Some(c) = e.observe(&obs(1, cx, 10_000.0), None, None, t(i as u64 * 100)) {
                events.push(c);
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].track_id, 1);
        assert_eq!(events[0].direction, Direction::In);
        assert_eq!(e.stats().in_count, 1);
        assert_eq!(e.stats().out_count, 0);
    }

    #[test]
    fn right_to_left_crossing_counts_as_out() {
        let mut e = engine(500.0, 5.0, 0.0);
        assert!(e.observe(&obs(2, 575.0, 10_000.0), None, None, t(0)).is_none());
        let c = e.observe(&obs(2, 425.0, 10_000.0), None, None, t(100)).unwrap();
        assert_eq!(c.direction, Direction::Out);
        assert_eq!(e.stats().out_count, 1);
    }

    #[test]
    fn jitter_around_line_is_suppressed() {
        let mut e = engine(400.0, 10.0, 0.0);
        for (i, cx) in [395.0, 405.0, 395.0, 405.0, 395.0].into_iter().enumerate() {
            assert!(e.observe(&obs(3, cx, 10_000.0), None, None, t(i as u64 * 100)).is_none());
        }
        assert_eq!(e.stats().in_count, 0);
        assert_eq!(e.stats().out_count, 0);
    }

    #[test]
    fn area_gate_blocks_pure_lateral_crossing() {
        let mut e = engine(400.0, 5.0, 0.15);
        for (i, cx) in [300.0, 500.0, 700.0].into_iter().enumerate() {
            assert!(e.observe(&obs(4, cx, 10_000.0), None, None, t(i as u64 * 100)).is_none());
        }
        assert_eq!(e.stats().in_count, 0);
    }

    #[test]
    fn area_gate_passes_when_person_approaches() {
        let mut e = engine(400.0, 5.0, 0.15);
        assert!(e.observe(&obs(5, 300.0, 10_000.0), None, None, t(0)).is_none());
        // 20% larger box across the line: both gates satisfied.
        let c = e.observe(&obs(5, 500.0, 12_000.0), None, None, t(100));
        assert!(c.is_some());
    }

    #[test]
    fn dedup_allows_at_most_one_event_per_direction() {
        let mut e = engine(400.0, 5.0, 0.0);
        e.observe(&obs(7, 300.0, 10_000.0), None, None, t(0));
        assert!(e.observe(&obs(7, 500.0, 10_000.0), None, None, t(100)).is_some()); // IN
        assert!(e.observe(&obs(7, 300.0, 10_000.0), None, None, t(200)).is_some()); // OUT
        // Second lap: both directions already counted.
        assert!(e.observe(&obs(7, 500.0, 10_000.0), None, None, t(300)).is_none());
        assert!(e.observe(&obs(7, 300.0, 10_000.0), None, None, t(400)).is_none());
        let stats = e.stats();
        assert_eq!(stats.in_count, 1);
        assert_eq!(stats.out_count, 1);
    }

    #[test]
    fn multiple_tracks_count_independently() {
        let mut e = engine(500.0, 5.0, 0.0);
        e.observe(&obs(5, 425.0, 10_000.0), None, None, t(0));
        e.observe(&obs(6, 445.0, 10_000.0), None, None, t(0));
        e.observe(&obs(7, 605.0, 10_000.0), None, None, t(0));
        assert!(e.observe(&obs(5, 575.0, 10_000.0), None, None, t(100)).is_some());
        assert!(e.observe(&obs(6, 585.0, 10_000.0), None, None, t(100)).is_some());
        assert!(e.observe(&obs(7, 445.0, 10_000.0), None, None, t(100)).is_some());
        let stats = e.stats();
        assert_eq!(stats.in_count, 2);
        assert_eq!(stats.out_count, 1);
        assert_eq!(stats.active_tracks, 3);
    }

    #[test]
    fn track_timeout_allows_recount_without_reid() {
        let mut e = CountingEngine::new(EngineConfig {
            line_x: 400.0,
            hysteresis_px: 5.0,
            area_change_threshold: 0.0,
            max_age: Duration::from_millis(500),
            cleanup_interval: Duration::from_millis(100),
            ..EngineConfig::default()
        });
        e.observe(&obs(42, 300.0, 10_000.0), None, None, t(0));
        assert!(e.observe(&obs(42, 500.0, 10_000.0), None, None, t(100)).is_some());

        // Track 42 ages out.
        e.maybe_cleanup(t(1000));
        assert_eq!(e.stats().active_tracks, 0);

        // Same person reappears as a new track id: counted again.
        e.observe(&obs(77, 300.0, 10_000.0), None, None, t(1100));
        assert!(e.observe(&obs(77, 500.0, 10_000.0), None, None, t(1200)).is_some());
        assert_eq!(e.stats().in_count, 2);
    }

    #[test]
    fn reid_link_suppresses_recount_after_timeout() {
        use crate::reid::GalleryConfig;
        let mut gallery = PersonGallery::new(GalleryConfig {
            similarity_threshold: 0.65,
            ..GalleryConfig::default()
        });
        let emb = {
            let mut v = vec![0.0f32; 8];
            v[0] = 1.0;
            v
        };

        let mut e = CountingEngine::new(EngineConfig {
            line_x: 400.0,
            hysteresis_px: 5.0,
            area_change_threshold: 0.0,
            max_age: Duration::from_millis(500),
            cleanup_interval: Duration::from_millis(100),
            ..EngineConfig::default()
        });

        e.observe(&obs(42, 300.0, 10_000.0), Some(&emb), Some(&mut gallery), t(0));
        assert!(e
            .observe(&obs(42, 500.0, 10_000.0), Some(&emb), Some(&mut gallery), t(100))
            .is_some());

        e.maybe_cleanup(t(1000));

        // Reappears under a fresh id with the same appearance: the match
        // imports the counted IN, so no second event fires.
        e.observe(&obs(77, 300.0, 10_000.0), Some(&emb), Some(&mut gallery), t(1100));
        assert!(e
            .observe(&obs(77, 500.0, 10_000.0), Some(&emb), Some(&mut gallery), t(1200))
            .is_none());
        assert_eq!(e.stats().in_count, 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut e = engine(400.0, 5.0, 0.0);
        e.observe(&obs(9, 300.0, 10_000.0), None, None, t(0));
        e.observe(&obs(9, 500.0, 10_000.0), None, None, t(100));
        assert_eq!(e.stats().in_count, 1);

        e.reset();
        let once = (e.stats().in_count, e.stats().out_count, e.stats().active_tracks);
        e.reset();
        let twice = (e.stats().in_count, e.stats().out_count, e.stats().active_tracks);
        assert_eq!(once, (0, 0, 0));
        assert_eq!(once, twice);
    }

    #[test]
    fn malformed_bbox_is_dropped() {
        let mut e = engine(400.0, 5.0, 0.0);
        let bad = Observation {
            track_id: 1,
            bbox: (500.0, 100.0, 450.0, 200.0),
            confidence: 0.9,
        };
        assert!(e.observe(&bad, None, None, t(0)).is_none());
        assert_eq!(e.stats().active_tracks, 0);
    }

    #[test]
    fn crossing_inside_hysteresis_band_never_promotes() {
        let mut e = engine(500.0, 10.0, 0.0);
        e.observe(&obs(3, 425.0, 10_000.0), None, None, t(0));
        // Side flips inside the band: not a qualifying crossing, and the
        // side bookkeeping still advances with the observation.
        assert!(e.observe(&obs(3, 505.0, 10_000.0), None, None, t(100)).is_none());
        // Already on the right; moving further right is not a side change.
        assert!(e.observe(&obs(3, 545.0, 10_000.0), None, None, t(200)).is_none());
        // The return trip in one clean step does qualify.
        assert!(e.observe(&obs(3, 425.0, 10_000.0), None, None, t(300)).is_some());
        assert_eq!(e.stats().out_count, 1);
    }
}
