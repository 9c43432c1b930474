//! SORT-like per-stream face tracker: greedy IoU association, track
//! promotion after min-hits, eviction after max-age frames without a
//! match, and the re-recognition throttle.
//!
//! A tracker is owned by exactly one stream and locked for the duration
//! of each frame, so recognition results are written back through the
//! methods below while the lock is held.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::attributes::FaceAttributes;
use crate::detector::{iou, Detection};

const MATCH_IOU_THRESHOLD: f32 = 0.3;

#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub bbox: [f32; 4],
    pub confidence: f32,
    /// Consecutive detection count.
    pub hits: u32,
    /// Frames since the last matched detection.
    pub time_since_update: u32,
    pub embedding: Option<Vec<f32>>,
    pub last_recognized: Option<Instant>,
    pub person_id: Option<Uuid>,
    pub match_score: f32,
    pub attributes: Option<FaceAttributes>,
    /// Written on first sighting; re-recognition events reuse it.
    pub snapshot_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub id: String,
    pub is_new: bool,
}

pub struct Tracker {
    stream_id: String,
    /// Insertion order, so association ties resolve deterministically.
    tracks: Vec<Track>,
    next_id: u64,
    max_age: u32,
    min_hits: u32,
}

impl Tracker {
    pub fn new(stream_id: String, max_age: u32, min_hits: u32) -> Self {
        Self {
            stream_id,
            tracks: Vec::new(),
            next_id: 0,
            max_age,
            min_hits,
        }
    }

    /// Associate detections with live tracks and mint tracks for the
    /// rest. Matched updates are emitted first (in detection order),
    /// then the new tracks.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<TrackUpdate> {
        for track in &mut self.tracks {
            track.time_since_update += 1;
        }

        let mut updates = Vec::with_capacity(detections.len());
        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];

        // Greedy IoU matching in detection order; best unmatched track
        // wins, earlier tracks win exact ties.
        for (di, det) in detections.iter().enumerate() {
            let mut best_iou = MATCH_IOU_THRESHOLD;
            let mut best: Option<usize> = None;

            for (ti, track) in self.tracks.iter().enumerate() {
                if track_matched[ti] {
                    continue;
                }
                let overlap = iou(&det.bbox, &track.bbox);
                if overlap > best_iou {
                    best_iou = overlap;
                    best = Some(ti);
                }
            }

            if let Some(ti) = best {
                let track = &mut self.tracks[ti];
                track.bbox = det.bbox;
                track.confidence = det.confidence;
                track.hits += 1;
                track.time_since_update = 0;
                track_matched[ti] = true;
                det_matched[di] = true;
                updates.push(TrackUpdate {
                    id: track.id.clone(),
                    is_new: false,
                });
            }
        }

        for (di, det) in detections.iter().enumerate() {
            if det_matched[di] {
                continue;
            }
            self.next_id += 1;
            let id = format!("{}_{}", self.stream_id, self.next_id);
            self.tracks.push(Track {
                id: id.clone(),
                bbox: det.bbox,
                confidence: det.confidence,
                hits: 1,
                time_since_update: 0,
                embedding: None,
                last_recognized: None,
                person_id: None,
                match_score: 0.0,
                attributes: None,
                snapshot_key: None,
            });
            updates.push(TrackUpdate { id, is_new: true });
        }

        let max_age = self.max_age;
        self.tracks.retain(|t| t.time_since_update <= max_age);

        updates
    }

    /// Pure recognition gate: confirmed tracks are re-embedded when they
    /// have no embedding yet or the throttle interval has elapsed. New
    /// tracks bypass this (the pipeline recognizes them immediately).
    pub fn should_recognize(&self, id: &str, interval: Duration, now: Instant) -> bool {
        let Some(track) = self.get(id) else {
            return false;
        };
        if track.hits < self.min_hits {
            return false;
        }
        match (track.embedding.as_ref(), track.last_recognized) {
            (None, _) | (_, None) => true,
            (Some(_), Some(at)) => now.duration_since(at) >= interval,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    pub fn record_recognition(&mut self, id: &str, embedding: Vec<f32>, at: Instant) {
        if let Some(track) = self.get_mut(id) {
            track.embedding = Some(embedding);
            track.last_recognized = Some(at);
        }
    }

    pub fn set_attributes(&mut self, id: &str, attributes: FaceAttributes) {
        if let Some(track) = self.get_mut(id) {
            track.attributes = Some(attributes);
        }
    }

    pub fn set_match(&mut self, id: &str, person_id: Uuid, score: f32) {
        if let Some(track) = self.get_mut(id) {
            track.person_id = Some(person_id);
            track.match_score = score;
        }
    }

    pub fn set_snapshot_key(&mut self, id: &str, key: String) {
        if let Some(track) = self.get_mut(id) {
            track.snapshot_key = Some(key);
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4]) -> Detection {
        Detection {
            bbox,
            confidence: 0.9,
            landmarks: [[0.0; 2]; 5],
        }
    }

    fn tracker() -> Tracker {
        Tracker::new("stream".to_string(), 3, 3)
    }

    #[test]
    fn unmatched_detections_mint_unique_tracks() {
        let mut t = tracker();
        let updates = t.update(&[
            det([0.0, 0.0, 50.0, 50.0]),
            det([200.0, 200.0, 260.0, 260.0]),
        ]);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.is_new));
        assert_eq!(updates[0].id, "stream_1");
        assert_eq!(updates[1].id, "stream_2");
        assert_eq!(t.track_count(), 2);
    }

    #[test]
    fn overlapping_detection_updates_existing_track() {
        let mut t = tracker();
        t.update(&[det([100.0, 100.0, 300.0, 300.0])]);

        let updates = t.update(&[det([102.0, 98.0, 302.0, 298.0])]);
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].is_new);
        assert_eq!(updates[0].id, "stream_1");

        let track = t.get("stream_1").unwrap();
        assert_eq!(track.hits, 2);
        assert_eq!(track.time_since_update, 0);
        assert_eq!(track.bbox, [102.0, 98.0, 302.0, 298.0]);
    }

    #[test]
    fn disjoint_faces_keep_independent_tracks() {
        let mut t = tracker();
        t.update(&[det([0.0, 0.0, 50.0, 50.0])]);
        let updates = t.update(&[det([500.0, 500.0, 560.0, 560.0])]);
        assert!(updates[0].is_new);
        assert_eq!(updates[0].id, "stream_2");
        assert_eq!(t.track_count(), 2);
    }

    #[test]
    fn stale_tracks_are_evicted_after_max_age() {
        let mut t = tracker();
        t.update(&[det([0.0, 0.0, 50.0, 50.0])]);

        for _ in 0..3 {
            t.update(&[]);
            assert_eq!(t.track_count(), 1);
        }
        // fourth empty frame pushes time_since_update past max_age
        t.update(&[]);
        assert_eq!(t.track_count(), 0);
    }

    #[test]
    fn no_surviving_track_exceeds_max_age() {
        let mut t = tracker();
        t.update(&[det([0.0, 0.0, 50.0, 50.0]), det([100.0, 0.0, 150.0, 50.0])]);
        for _ in 0..10 {
            t.update(&[]);
            assert!(t.tracks.iter().all(|tr| tr.time_since_update <= 3));
        }
    }

    #[test]
    fn recognition_gate_requires_min_hits() {
        let mut t = tracker();
        let now = Instant::now();
        t.update(&[det([0.0, 0.0, 50.0, 50.0])]);

        // hits=1 < min_hits=3
        assert!(!t.should_recognize("stream_1", Duration::from_secs(3), now));

        t.update(&[det([0.0, 0.0, 50.0, 50.0])]);
        t.update(&[det([0.0, 0.0, 50.0, 50.0])]);
        // hits=3, no embedding yet
        assert!(t.should_recognize("stream_1", Duration::from_secs(3), now));
    }

    #[test]
    fn recognition_throttle_boundary() {
        let mut t = tracker();
        for _ in 0..3 {
            t.update(&[det([0.0, 0.0, 50.0, 50.0])]);
        }

        let t0 = Instant::now();
        let interval = Duration::from_secs(3);
        t.record_recognition("stream_1", vec![0.1; 512], t0);

        assert!(!t.should_recognize("stream_1", interval, t0));
        assert!(!t.should_recognize("stream_1", interval, t0 + interval - Duration::from_millis(1)));
        assert!(t.should_recognize("stream_1", interval, t0 + interval));
        assert!(t.should_recognize("stream_1", interval, t0 + interval * 2));
    }

    #[test]
    fn equal_overlap_prefers_earlier_track() {
        let mut t = tracker();
        // two co-located tracks: same-frame detections never match each
        // other, so both are minted
        t.update(&[det([0.0, 0.0, 50.0, 50.0]), det([0.0, 0.0, 50.0, 50.0])]);
        assert_eq!(t.track_count(), 2);

        // a detection overlapping both equally must pick stream_1
        let updates = t.update(&[det([0.0, 0.0, 50.0, 50.0])]);
        assert_eq!(updates[0].id, "stream_1");
        assert!(!updates[0].is_new);
    }

    #[test]
    fn recognition_state_written_back() {
        let mut t = tracker();
        t.update(&[det([0.0, 0.0, 50.0, 50.0])]);

        let person = Uuid::new_v4();
        t.record_recognition("stream_1", vec![1.0; 512], Instant::now());
        t.set_match("stream_1", person, 0.92);
        t.set_snapshot_key("stream_1", "snapshots/s/stream_1.jpg".to_string());

        let track = t.get("stream_1").unwrap();
        assert_eq!(track.person_id, Some(person));
        assert_eq!(track.match_score, 0.92);
        assert!(track.embedding.is_some());
        assert_eq!(
            track.snapshot_key.as_deref(),
            Some("snapshots/s/stream_1.jpg")
        );
    }
}
