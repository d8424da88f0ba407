//! Up-next queue, current position and the seen-set used to keep related
//! expansion from suggesting the same track twice.

use cadence_proto::model::Track;
use cadence_proto::protocol::PlaybackMode;
use std::collections::HashSet;
use tracing::debug;

pub struct QueueManager {
    tracks: Vec<Track>,
    /// `None` means nothing selected.
    position: Option<usize>,
    seen: HashSet<String>,
    max_len: usize,
    refill_threshold: usize,
}

impl QueueManager {
    pub fn new(max_len: usize, refill_threshold: usize) -> Self {
        Self {
            tracks: Vec::new(),
            position: None,
            seen: HashSet::new(),
            max_len: max_len.max(1),
            refill_threshold,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn current(&self) -> Option<&Track> {
        self.position.and_then(|p| self.tracks.get(p))
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Install the results of an explicit search.
    pub fn replace(&mut self, mut tracks: Vec<Track>) {
        tracks.truncate(self.max_len);
        self.seen.clear();
        self.seen.extend(tracks.iter().map(|t| t.id.clone()));
        self.tracks = tracks;
        self.position = None;
    }

    /// Install a list that is not a search result (a playlist, a single
    /// recommendation).  Not truncated; the seen-set is left alone.
    pub fn install(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks;
        self.position = None;
    }

    /// Merge related tracks behind the current one.  Returns how many were
    /// added; zero means the queue and seen-set are untouched.
    ///
    /// The result is `[current, ...tail, ...added]` capped at the maximum
    /// length, with the played prefix dropped and position reset to 0.
    pub fn append_related(
        &mut self,
        candidates: Vec<Track>,
        mode: PlaybackMode,
        requested_for: &str,
    ) -> usize {
        if mode == PlaybackMode::Playlist {
            return 0;
        }
        let Some(pos) = self.position else {
            return 0;
        };
        let Some(current) = self.tracks.get(pos).cloned() else {
            return 0;
        };
        if current.id != requested_for {
            debug!(
                "queue: related for {} applied relative to current {}",
                requested_for, current.id
            );
        }

        let mut added = Vec::new();
        for candidate in candidates {
            if candidate.same_title(&current.title) || self.seen.contains(&candidate.id) {
                continue;
            }
            self.seen.insert(candidate.id.clone());
            added.push(candidate);
        }
        if added.is_empty() {
            return 0;
        }
        let count = added.len();

        let mut rebuilt = Vec::with_capacity(self.max_len);
        rebuilt.push(current);
        rebuilt.extend(self.tracks.drain(pos + 1..));
        rebuilt.extend(added);
        rebuilt.truncate(self.max_len);

        self.tracks = rebuilt;
        self.position = Some(0);
        count
    }

    /// Append a user-chosen track.  Refused once the queue is at its
    /// maximum length.
    pub fn push(&mut self, track: Track) -> bool {
        if self.tracks.len() >= self.max_len {
            return false;
        }
        self.seen.insert(track.id.clone());
        self.tracks.push(track);
        true
    }

    /// Tracks after the current one; the whole queue when nothing is selected.
    pub fn remaining(&self) -> usize {
        let consumed = self.position.map_or(0, |p| p + 1);
        self.tracks.len().saturating_sub(consumed)
    }

    pub fn needs_refill(&self) -> bool {
        self.remaining() <= self.refill_threshold
    }

    /// Remove an entry.  Out-of-range indices and the selected entry are
    /// rejected; entries before the selection shift it down by one.
    pub fn remove_at(&mut self, index: usize) -> Option<Track> {
        if index >= self.tracks.len() || Some(index) == self.position {
            return None;
        }
        let removed = self.tracks.remove(index);
        if let Some(pos) = self.position {
            if index < pos {
                self.position = Some(pos - 1);
            }
        }
        Some(removed)
    }

    pub fn set_position(&mut self, index: usize) -> bool {
        if index < self.tracks.len() {
            self.position = Some(index);
            true
        } else {
            false
        }
    }

    pub fn clear_position(&mut self) {
        self.position = None;
    }

    pub fn next_index(&self) -> Option<usize> {
        let next = self.position.map_or(0, |p| p + 1);
        (next < self.tracks.len()).then_some(next)
    }

    pub fn prev_index(&self) -> Option<usize> {
        self.position.and_then(|p| p.checked_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks(ids: &[&str]) -> Vec<Track> {
        ids.iter()
            .map(|id| Track::new(*id, format!("Title {}", id)))
            .collect()
    }

    fn ids(queue: &QueueManager) -> Vec<&str> {
        queue.tracks().iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_replace_resets_context() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b"]));
        q.set_position(1);
        q.replace(tracks(&["c", "d", "e", "f"]));
        assert_eq!(q.position(), None);
        assert_eq!(q.remaining(), 4);
        assert!(!q.is_seen("a"));
        assert!(q.is_seen("f"));
    }

    #[test]
    fn test_push_respects_max_len() {
        let mut q = QueueManager::new(3, 1);
        q.replace(tracks(&["a", "b"]));
        assert!(q.push(Track::new("x", "X")));
        assert!(!q.push(Track::new("y", "Y")));
        assert_eq!(ids(&q), vec!["a", "b", "x"]);
        assert!(q.is_seen("x"));
        assert!(!q.is_seen("y"));
    }

    #[test]
    fn test_replace_truncates() {
        let mut q = QueueManager::new(3, 1);
        q.replace(tracks(&["a", "b", "c", "d"]));
        assert_eq!(ids(&q), vec!["a", "b", "c"]);
        assert!(!q.is_seen("d"));
    }

    #[test]
    fn test_append_related_drops_played_prefix() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b", "c", "d"]));
        q.set_position(2);
        let added = q.append_related(tracks(&["x", "y"]), PlaybackMode::SearchQueue, "c");
        assert_eq!(added, 2);
        assert_eq!(ids(&q), vec!["c", "d", "x", "y"]);
        assert_eq!(q.position(), Some(0));
    }

    #[test]
    fn test_append_related_filters_seen_and_same_title() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b"]));
        q.set_position(0);
        let mut candidates = tracks(&["b", "x"]);
        candidates.push(Track::new("z", "TITLE A"));
        let added = q.append_related(candidates, PlaybackMode::SearchQueue, "a");
        assert_eq!(added, 1);
        assert_eq!(ids(&q), vec!["a", "b", "x"]);
        assert!(!q.is_seen("z"));
    }

    #[test]
    fn test_append_related_ignores_duplicate_candidates() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a"]));
        q.set_position(0);
        q.append_related(tracks(&["x", "x"]), PlaybackMode::SearchQueue, "a");
        assert_eq!(ids(&q), vec!["a", "x"]);
    }

    #[test]
    fn test_append_related_noops() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b"]));
        // nothing selected
        assert_eq!(q.append_related(tracks(&["x"]), PlaybackMode::SearchQueue, "a"), 0);
        assert!(!q.is_seen("x"));

        q.set_position(0);
        assert_eq!(q.append_related(tracks(&["x"]), PlaybackMode::Playlist, "a"), 0);
        assert!(!q.is_seen("x"));

        // nothing survives: queue and position untouched
        q.set_position(1);
        assert_eq!(q.append_related(tracks(&["a"]), PlaybackMode::SearchQueue, "b"), 0);
        assert_eq!(ids(&q), vec!["a", "b"]);
        assert_eq!(q.position(), Some(1));
    }

    #[test]
    fn test_append_related_caps_length() {
        let mut q = QueueManager::new(5, 3);
        q.replace(tracks(&["a", "b", "c"]));
        q.set_position(0);
        let more: Vec<String> = (0..10).map(|i| format!("r{}", i)).collect();
        let more: Vec<&str> = more.iter().map(String::as_str).collect();
        q.append_related(tracks(&more), PlaybackMode::SearchQueue, "a");
        assert_eq!(ids(&q), vec!["a", "b", "c", "r0", "r1"]);
    }

    #[test]
    fn test_remaining_and_refill() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b", "c", "d", "e"]));
        assert_eq!(q.remaining(), 5);
        assert!(!q.needs_refill());
        q.set_position(0);
        assert_eq!(q.remaining(), 4);
        assert!(!q.needs_refill());
        q.set_position(1);
        assert!(q.needs_refill());
        q.set_position(4);
        assert_eq!(q.remaining(), 0);
    }

    #[test]
    fn test_remove_before_current_shifts_position() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b", "c", "d"]));
        q.set_position(2);
        assert_eq!(q.remove_at(0).map(|t| t.id), Some("a".to_string()));
        assert_eq!(q.position(), Some(1));
        assert_eq!(q.current().map(|t| t.id.as_str()), Some("c"));
        q.remove_at(2);
        assert_eq!(q.position(), Some(1));
        assert_eq!(ids(&q), vec!["b", "c"]);
    }

    #[test]
    fn test_remove_rejects_out_of_range_and_current() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b"]));
        q.set_position(1);
        assert!(q.remove_at(5).is_none());
        assert!(q.remove_at(1).is_none());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_navigation_indices() {
        let mut q = QueueManager::new(20, 3);
        q.replace(tracks(&["a", "b"]));
        assert_eq!(q.next_index(), Some(0));
        assert_eq!(q.prev_index(), None);
        q.set_position(1);
        assert_eq!(q.next_index(), None);
        assert_eq!(q.prev_index(), Some(0));
        assert!(!q.set_position(2));
    }

    #[test]
    fn test_install_keeps_seen_set() {
        let mut q = QueueManager::new(2, 3);
        q.replace(tracks(&["a"]));
        q.install(tracks(&["p1", "p2", "p3"]));
        assert_eq!(q.len(), 3);
        assert!(q.is_seen("a"));
        assert!(!q.is_seen("p1"));
    }
}
