//! Bounded LRU gallery of known persons.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::embedding::cosine_similarity;
use crate::counting::{CountedDirections, Direction};

/// How many recent track ids a person record remembers.
const TRACK_HISTORY: usize = 16;
/// EMA weight of the newly observed embedding on an accepted match.
const EMBEDDING_ALPHA: f32 = 0.3;
/// A snapshot is due after this many record mutations.
const FLUSH_EVERY_UPDATES: u32 = 10;

/// Gallery tuning, from the active camera settings row.
#[derive(Debug, Clone)]
pub struct GalleryConfig {
    /// Minimum cosine similarity for an embedding to match a known person.
    pub similarity_threshold: f32,
    pub max_persons: usize,
    /// Blend accepted matches into the stored embedding.
    pub update_embeddings: bool,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.65,
            max_persons: 100,
            update_embeddings: true,
        }
    }
}

/// A known person. Persists across restarts via the gallery snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonRecord {
    pub person_id: String,
    pub embedding: Vec<f32>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub appearance_count: u32,
    /// Most-recent-first ring of track ids this person appeared as.
    pub track_ids: Vec<i64>,
    /// Directions counted since the last reset.
    #[serde(default)]
    pub counted: CountedDirections,
}

impl PersonRecord {
    fn note_track(&mut self, track_id: i64) {
        if !self.track_ids.contains(&track_id) {
            self.track_ids.insert(0, track_id);
            self.track_ids.truncate(TRACK_HISTORY);
        }
    }
}

/// API summary of a person (embedding omitted).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonSummary {
    pub person_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub appearance_count: u32,
    pub track_ids: Vec<i64>,
    pub counted_in: bool,
    pub counted_out: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct GallerySnapshot {
    persons: Vec<PersonRecord>,
    next_person_id: u32,
}

/// The in-memory gallery. Owned by the CV worker.
pub struct PersonGallery {
    config: GalleryConfig,
    persons: HashMap<String, PersonRecord>,
    next_person_id: u32,
    updates_since_flush: u32,
}

impl PersonGallery {
    pub fn new(config: GalleryConfig) -> Self {
        Self {
            config,
            persons: HashMap::new(),
            next_person_id: 1,
            updates_since_flush: 0,
        }
    }

    /// Swap in new tuning without touching the records.
    pub fn set_config(&mut self, config: GalleryConfig) {
        self.config = config;
    }

    /// Load the snapshot at `path`, or start empty. A corrupt or missing
    /// file never aborts counting.
    pub fn load(config: GalleryConfig, path: &Path) -> Self {
        let mut gallery = Self::new(config);
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<GallerySnapshot>(&bytes) {
                Ok(snapshot) => {
                    gallery.next_person_id = snapshot.next_person_id;
                    gallery.persons = snapshot
                        .persons
                        .into_iter()
                        .map(|p| (p.person_id.clone(), p))
                        .collect();
                    tracing::info!(
                        path = %path.display(),
                        persons = gallery.persons.len(),
                        "Re-ID gallery loaded"
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Re-ID gallery file unreadable, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Re-ID gallery load failed, starting empty");
            }
        }
        gallery
    }

    /// Write the snapshot to `path`.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = GallerySnapshot {
            persons: self.persons.values().cloned().collect(),
            next_person_id: self.next_person_id,
        };
        let json = serde_json::to_vec(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// True once enough mutations have accumulated to warrant a flush.
    /// Calling this resets the counter.
    pub fn take_flush_due(&mut self) -> bool {
        if self.updates_since_flush >= FLUSH_EVERY_UPDATES {
            self.updates_since_flush = 0;
            true
        } else {
            false
        }
    }

    /// Match `embedding` against the gallery, registering a new person when
    /// nothing scores at or above the similarity threshold. Returns the
    /// person id either way.
    pub fn match_or_register(&mut self, embedding: &[f32], track_id: i64) -> String {
        let best = self
            .persons
            .values()
            .map(|p| (p.person_id.clone(), cosine_similarity(embedding, &p.embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((person_id, similarity)) = best {
            if similarity >= self.config.similarity_threshold {
                tracing::debug!(person_id = %person_id, similarity = similarity, track_id = track_id, "Re-ID match");
                self.touch(&person_id, track_id, embedding);
                return person_id;
            }
        }

        self.register(embedding, track_id)
    }

    fn register(&mut self, embedding: &[f32], track_id: i64) -> String {
        if self.persons.len() >= self.config.max_persons {
            if let Some(oldest) = self
                .persons
                .values()
                .min_by_key(|p| p.last_seen)
                .map(|p| p.person_id.clone())
            {
                self.persons.remove(&oldest);
                tracing::warn!(person_id = %oldest, "Re-ID gallery full, evicted least recently seen person");
            }
        }

        let person_id = format!("P{:04}", self.next_person_id);
        self.next_person_id += 1;

        let now = Utc::now();
        self.persons.insert(
            person_id.clone(),
            PersonRecord {
                person_id: person_id.clone(),
                embedding: embedding.to_vec(),
                first_seen: now,
                last_seen: now,
                appearance_count: 1,
                track_ids: vec![track_id],
                counted: CountedDirections::default(),
            },
        );
        self.updates_since_flush += 1;

        tracing::info!(person_id = %person_id, track_id = track_id, "New person registered");
        person_id
    }

    fn touch(&mut self, person_id: &str, track_id: i64, embedding: &[f32]) {
        let update_embeddings = self.config.update_embeddings;
        let Some(person) = self.persons.get_mut(person_id) else {
            return;
        };
        person.last_seen = Utc::now();
        person.appearance_count += 1;
        person.note_track(track_id);

        if update_embeddings && person.embedding.len() == embedding.len() {
            for (old, new) in person.embedding.iter_mut().zip(embedding) {
                *old = (1.0 - EMBEDDING_ALPHA) * *old + EMBEDDING_ALPHA * new;
            }
            let norm: f32 = person.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in person.embedding.iter_mut() {
                    *v /= norm;
                }
            }
        }
        self.updates_since_flush += 1;
    }

    pub fn counted_directions(&self, person_id: &str) -> CountedDirections {
        self.persons
            .get(person_id)
            .map(|p| p.counted)
            .unwrap_or_default()
    }

    pub fn mark_counted(&mut self, person_id: &str, direction: Direction) {
        if let Some(person) = self.persons.get_mut(person_id) {
            person.counted.insert(direction);
            self.updates_since_flush += 1;
        }
    }

    /// Forget counted directions for every person (counter reset without a
    /// gallery wipe).
    pub fn clear_counted(&mut self) {
        for person in self.persons.values_mut() {
            person.counted = CountedDirections::default();
        }
    }

    /// Drop every person and restart id assignment.
    pub fn clear(&mut self) {
        self.persons.clear();
        self.next_person_id = 1;
        self.updates_since_flush += 1;
        tracing::info!("Re-ID gallery cleared");
    }

    /// Remove persons not seen within `max_age_days`. Returns how many were
    /// removed.
    pub fn cleanup(&mut self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let before = self.persons.len();
        self.persons.retain(|_, p| p.last_seen >= cutoff);
        let removed = before - self.persons.len();
        if removed > 0 {
            self.updates_since_flush += 1;
            tracing::info!(removed = removed, "Stale persons removed from gallery");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    pub fn summaries(&self) -> Vec<PersonSummary> {
        let mut out: Vec<PersonSummary> = self.persons.values().map(Self::summary_of).collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    pub fn summary(&self, person_id: &str) -> Option<PersonSummary> {
        self.persons.get(person_id).map(Self::summary_of)
    }

    fn summary_of(p: &PersonRecord) -> PersonSummary {
        PersonSummary {
            person_id: p.person_id.clone(),
            first_seen: p.first_seen,
            last_seen: p.last_seen,
            appearance_count: p.appearance_count,
            track_ids: p.track_ids.clone(),
            counted_in: p.counted.in_counted,
            counted_out: p.counted.out_counted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn register_then_match_same_embedding() {
        let mut g = PersonGallery::new(GalleryConfig::default());
        let emb = unit(8, 0);

        let first = g.match_or_register(&emb, 1);
        let second = g.match_or_register(&emb, 2);
        assert_eq!(first, second);
        assert_eq!(g.len(), 1);

        let summary = g.summary(&first).unwrap();
        assert_eq!(summary.appearance_count, 2);
        assert_eq!(summary.track_ids, vec![2, 1]);
    }

    #[test]
    fn dissimilar_embedding_registers_new_person() {
        let mut g = PersonGallery::new(GalleryConfig::default());
        let a = g.match_or_register(&unit(8, 0), 1);
        let b = g.match_or_register(&unit(8, 1), 2);
        assert_ne!(a, b);
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn gallery_evicts_least_recently_seen_when_full() {
        let mut g = PersonGallery::new(GalleryConfig {
            max_persons: 2,
            ..GalleryConfig::default()
        });
        let first = g.match_or_register(&unit(8, 0), 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        g.match_or_register(&unit(8, 1), 2);
        std::thread::sleep(std::time::Duration::from_millis(5));
        g.match_or_register(&unit(8, 2), 3);

        assert_eq!(g.len(), 2);
        assert!(g.summary(&first).is_none());
    }

    #[test]
    fn counted_directions_survive_rematch_and_clear() {
        let mut g = PersonGallery::new(GalleryConfig::default());
        let pid = g.match_or_register(&unit(8, 0), 1);
        g.mark_counted(&pid, Direction::In);
        assert!(g.counted_directions(&pid).in_counted);

        g.clear_counted();
        assert!(!g.counted_directions(&pid).in_counted);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn ema_update_keeps_embedding_normalized() {
        let mut g = PersonGallery::new(GalleryConfig::default());
        let pid = g.match_or_register(&unit(8, 0), 1);

        let mut drifted = unit(8, 0);
        drifted[1] = 0.3;
        let norm: f32 = drifted.iter().map(|x| x * x).sum::<f32>().sqrt();
        for v in drifted.iter_mut() {
            *v /= norm;
        }
        let matched = g.match_or_register(&drifted, 2);
        assert_eq!(matched, pid);

        let emb = &g.persons[&pid].embedding;
        let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");

        let mut g = PersonGallery::new(GalleryConfig::default());
        let pid = g.match_or_register(&unit(8, 0), 7);
        g.mark_counted(&pid, Direction::Out);
        g.save(&path).unwrap();

        let restored = PersonGallery::load(GalleryConfig::default(), &path);
        assert_eq!(restored.len(), 1);
        assert!(restored.counted_directions(&pid).out_counted);
        let summary = restored.summary(&pid).unwrap();
        assert_eq!(summary.track_ids, vec![7]);
    }

    #[test]
    fn cleanup_removes_stale_persons() {
        let mut g = PersonGallery::new(GalleryConfig::default());
        let pid = g.match_or_register(&unit(8, 0), 1);
        g.persons.get_mut(&pid).unwrap().last_seen = Utc::now() - chrono::Duration::days(30);
        let removed = g.cleanup(7);
        assert_eq!(removed, 1);
        assert!(g.is_empty());
    }

    #[test]
    fn flush_due_after_enough_updates() {
        let mut g = PersonGallery::new(GalleryConfig::default());
        for i in 0..10 {
            g.match_or_register(&unit(16, i), i as i64);
        }
        assert!(g.take_flush_due());
        assert!(!g.take_flush_due());
    }
}
