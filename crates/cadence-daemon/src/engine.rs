use async_trait::async_trait;
use cadence_proto::protocol::EngineHealth;

use crate::error::EngineResult;

/// Signals pushed by the engine.  Delivered to the event loop as
/// `CoreEvent::Engine`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TimePos(Option<f64>),
    Duration(Option<f64>),
    Pause(bool),
    /// The new source produced its first frames.
    Started,
    /// Reached the natural end of the source.
    Ended,
    /// The source could not be played (decode, network, device).
    Failed(String),
    Health(EngineHealth),
}

/// The single audio output.
///
/// `load` returning `Ok` means the engine accepted the source, not that it is
/// audible: the outcome arrives later as `Started` or `Failed`.  An `Err`
/// from `load` leaves the previous output untouched.
#[async_trait]
pub trait PlaybackEngine: Send {
    async fn load(&mut self, url: &str, volume: f32) -> EngineResult<()>;

    async fn set_pause(&mut self, paused: bool) -> EngineResult<()>;

    async fn seek_to(&mut self, secs: f64) -> EngineResult<()>;

    async fn set_volume(&mut self, volume: f32) -> EngineResult<()>;

    async fn stop(&mut self) -> EngineResult<()>;

    /// `false` once a previously started engine has gone away.
    async fn check_alive(&mut self) -> bool;

    async fn shutdown(&mut self);
}
