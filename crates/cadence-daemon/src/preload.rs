//! Preload state machine for the next search-queue track.
//!
//! One slot, tied to the queue entry after the current one.  The coordinator
//! is the single owner of preload state; the event loop asks it whether to
//! start, feeds it results, and takes the slot at track end.

use cadence_proto::model::{StreamRef, Track};
use tracing::debug;

use crate::token::{RequestToken, TokenSource};

/// A resolved next track, ready to hand to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadSlot {
    pub track: Track,
    pub stream: StreamRef,
    /// Queue index the slot was primed for.
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SlotState {
    #[default]
    Idle,
    /// Resolution in flight.
    Pending {
        token: RequestToken,
        track_id: String,
        index: usize,
    },
    Ready(PreloadSlot),
    /// Resolution failed; the track end falls back to a normal load.
    Failed { track_id: String },
}

#[derive(Debug, Default)]
pub struct PreloadCoordinator {
    state: SlotState,
    /// Set once per track transition so the 80% mark fires only once.
    started: bool,
}

impl PreloadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn state(&self) -> &SlotState {
        &self.state
    }

    /// Whether playback progress should trigger a preload now.
    pub fn should_begin(&self, progress: f64, threshold: f64, autoplay: bool) -> bool {
        autoplay && !self.started && progress >= threshold
    }

    /// Record that this transition's preload attempt has been made even
    /// though nothing was resolved (no next track yet).
    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Start resolving `track` at `index`.  Returns the token the result must
    /// carry.
    pub fn begin(&mut self, tokens: &mut TokenSource, track: &Track, index: usize) -> RequestToken {
        let token = tokens.issue();
        debug!("preload: begin {} at {} ({})", track.id, index, token);
        self.state = SlotState::Pending {
            token,
            track_id: track.id.clone(),
            index,
        };
        self.started = true;
        token
    }

    /// Store a finished resolution.  Accepted only if `token` is the pending
    /// one and `expected_next` still matches what was requested.  Returns
    /// whether the result was kept.
    pub fn complete(
        &mut self,
        token: RequestToken,
        result: Result<StreamRef, String>,
        expected_next: Option<(&Track, usize)>,
    ) -> bool {
        let (track_id, index) = match &self.state {
            SlotState::Pending {
                token: pending,
                track_id,
                index,
            } if *pending == token => (track_id.clone(), *index),
            _ => {
                debug!("preload: dropping stale result {}", token);
                return false;
            }
        };

        let next = match expected_next {
            Some((track, i)) if track.id == track_id && i == index => track.clone(),
            _ => {
                debug!("preload: next track changed under {}, discarding", token);
                self.state = SlotState::Idle;
                return false;
            }
        };

        match result {
            Ok(stream) => {
                debug!("preload: ready {}", track_id);
                self.state = SlotState::Ready(PreloadSlot {
                    track: next,
                    stream,
                    index,
                });
                true
            }
            Err(e) => {
                debug!("preload: failed {}: {}", track_id, e);
                self.state = SlotState::Failed { track_id };
                false
            }
        }
    }

    /// Take the slot if it was primed for `expected_next` at `index`.
    /// A mismatched slot is discarded.
    pub fn consume(&mut self, expected_next: &Track, index: usize) -> Option<PreloadSlot> {
        let state = std::mem::take(&mut self.state);
        self.started = false;
        match state {
            SlotState::Ready(slot) if slot.track.id == expected_next.id && slot.index == index => {
                Some(slot)
            }
            SlotState::Ready(slot) => {
                debug!(
                    "preload: slot for {} does not match next {}, discarding",
                    slot.track.id, expected_next.id
                );
                None
            }
            _ => None,
        }
    }

    /// Drop everything.  In-flight results become stale.
    pub fn invalidate(&mut self) {
        if !matches!(self.state, SlotState::Idle) {
            debug!("preload: invalidated");
        }
        self.state = SlotState::Idle;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: &str) -> StreamRef {
        StreamRef {
            track_id: id.to_string(),
            url: format!("http://media/api/proxy/{}", id),
            duration: Some(200.0),
            format: None,
        }
    }

    #[test]
    fn test_should_begin_once() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        assert!(!p.should_begin(0.79, 0.8, true));
        assert!(!p.should_begin(0.9, 0.8, false));
        assert!(p.should_begin(0.8, 0.8, true));
        p.begin(&mut tokens, &Track::new("b", "B"), 1);
        assert!(!p.should_begin(0.95, 0.8, true));
    }

    #[test]
    fn test_ready_slot_is_consumed_for_matching_next() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        let b = Track::new("b", "B");
        let token = p.begin(&mut tokens, &b, 1);
        assert!(p.complete(token, Ok(stream("b")), Some((&b, 1))));
        let slot = p.consume(&b, 1).unwrap();
        assert_eq!(slot.stream.url, "http://media/api/proxy/b");
        assert_eq!(p.state(), &SlotState::Idle);
        // the next transition may preload again
        assert!(p.should_begin(0.9, 0.8, true));
    }

    #[test]
    fn test_slot_for_skipped_track_is_unusable() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        let b = Track::new("b", "B");
        let c = Track::new("c", "C");
        let token = p.begin(&mut tokens, &b, 1);
        p.complete(token, Ok(stream("b")), Some((&b, 1)));
        assert!(p.consume(&c, 2).is_none());
        assert_eq!(p.state(), &SlotState::Idle);
    }

    #[test]
    fn test_stale_token_is_dropped() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        let b = Track::new("b", "B");
        let old = p.begin(&mut tokens, &b, 1);
        p.invalidate();
        let fresh = p.begin(&mut tokens, &b, 1);
        assert!(!p.complete(old, Ok(stream("b")), Some((&b, 1))));
        assert!(matches!(p.state(), SlotState::Pending { token, .. } if *token == fresh));
    }

    #[test]
    fn test_result_after_invalidate_is_dropped() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        let b = Track::new("b", "B");
        let token = p.begin(&mut tokens, &b, 1);
        p.invalidate();
        assert!(!p.complete(token, Ok(stream("b")), Some((&b, 1))));
        assert_eq!(p.state(), &SlotState::Idle);
    }

    #[test]
    fn test_changed_next_discards_result() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        let b = Track::new("b", "B");
        let x = Track::new("x", "X");
        let token = p.begin(&mut tokens, &b, 1);
        assert!(!p.complete(token, Ok(stream("b")), Some((&x, 1))));
        assert_eq!(p.state(), &SlotState::Idle);
    }

    #[test]
    fn test_failure_leaves_no_slot() {
        let mut tokens = TokenSource::default();
        let mut p = PreloadCoordinator::new();
        let b = Track::new("b", "B");
        let token = p.begin(&mut tokens, &b, 1);
        assert!(!p.complete(token, Err("boom".into()), Some((&b, 1))));
        assert!(p.consume(&b, 1).is_none());
    }
}
