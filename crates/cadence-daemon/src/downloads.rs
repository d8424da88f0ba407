//! Download manager for library downloads
//!
//! One in-flight download per track.  The progress subscription is opened
//! before the download request so no early update is missed, and closed when
//! the request concludes or the user dismisses it.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_proto::protocol::ActiveDownload;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::core::{CoreEvent, LibraryEvent};
use crate::service::MediaService;

/// An in-flight download
struct ActiveEntry {
    /// Last reported progress (0.0 - 100.0)
    percent: f32,
    /// Closes the progress subscription early
    dismiss: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct DownloadManager {
    /// Track id -> in-flight download, in start order
    active: HashMap<String, ActiveEntry>,
    order: Vec<String>,
}

impl DownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start downloading a track.  Progress and the outcome come back as
    /// `LibraryEvent`s on `events`.
    pub fn start(
        &mut self,
        track_id: &str,
        service: Arc<dyn MediaService>,
        events: mpsc::Sender<CoreEvent>,
    ) -> Result<(), String> {
        if self.is_active(track_id) {
            return Err("Already downloading".to_string());
        }

        info!("Starting download of {}", track_id);
        let (dismiss_tx, dismiss_rx) = oneshot::channel();
        self.active.insert(
            track_id.to_string(),
            ActiveEntry {
                percent: 0.0,
                dismiss: Some(dismiss_tx),
            },
        );
        self.order.push(track_id.to_string());

        let track_id = track_id.to_string();
        tokio::spawn(async move {
            // Subscribe first; the request itself blocks until the file is done
            let forwarder = match service.download_progress(&track_id).await {
                Ok(stream) => Some(tokio::spawn(Self::forward_progress(
                    track_id.clone(),
                    stream,
                    dismiss_rx,
                    events.clone(),
                ))),
                Err(e) => {
                    warn!("Progress subscription for {} failed: {}", track_id, e);
                    None
                }
            };

            let result = service.download(&track_id).await;
            if let Some(forwarder) = forwarder {
                forwarder.abort();
            }
            match &result {
                Ok(filename) => info!("Download complete: {}", filename),
                Err(e) => error!("Download of {} failed: {}", track_id, e),
            }

            let _ = events
                .send(CoreEvent::Library(LibraryEvent::DownloadFinished {
                    track_id,
                    result,
                }))
                .await;
        });

        Ok(())
    }

    async fn forward_progress(
        track_id: String,
        mut stream: futures_util::stream::BoxStream<'static, f32>,
        mut dismiss: oneshot::Receiver<()>,
        events: mpsc::Sender<CoreEvent>,
    ) {
        loop {
            let percent = tokio::select! {
                _ = &mut dismiss => {
                    debug!("Progress for {} dismissed", track_id);
                    break;
                }
                next = stream.next() => match next {
                    Some(p) => p,
                    None => break,
                },
            };
            let evt = CoreEvent::Library(LibraryEvent::DownloadProgress {
                track_id: track_id.clone(),
                percent,
            });
            if events.send(evt).await.is_err() || percent >= 100.0 {
                break;
            }
        }
    }

    /// Record progress.  Returns `false` for downloads no longer tracked.
    pub fn update(&mut self, track_id: &str, percent: f32) -> bool {
        match self.active.get_mut(track_id) {
            Some(entry) if entry.dismiss.is_some() => {
                entry.percent = percent.clamp(0.0, 100.0);
                true
            }
            _ => false,
        }
    }

    pub fn finish(&mut self, track_id: &str) {
        self.active.remove(track_id);
        self.order.retain(|id| id != track_id);
    }

    /// Stop reporting progress for a download.  The request itself still
    /// runs to completion.
    pub fn dismiss(&mut self, track_id: &str) {
        if let Some(entry) = self.active.get_mut(track_id) {
            if let Some(tx) = entry.dismiss.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn is_active(&self, track_id: &str) -> bool {
        self.active.contains_key(track_id)
    }

    /// Downloads whose progress is still shown, in start order.
    pub fn snapshot(&self) -> Vec<ActiveDownload> {
        self.order
            .iter()
            .filter_map(|id| {
                let entry = self.active.get(id)?;
                entry.dismiss.as_ref()?;
                Some(ActiveDownload {
                    track_id: id.clone(),
                    percent: entry.percent,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeService;

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let service = Arc::new(FakeService::default());
        let (tx, _rx) = mpsc::channel(16);
        let mut manager = DownloadManager::new();
        assert!(manager.start("a", service.clone(), tx.clone()).is_ok());
        assert_eq!(
            manager.start("a", service, tx),
            Err("Already downloading".to_string())
        );
    }

    #[tokio::test]
    async fn test_progress_then_finish() {
        let service = Arc::new(FakeService::default());
        let (tx, mut rx) = mpsc::channel(16);
        let mut manager = DownloadManager::new();
        manager.start("a", service, tx).unwrap();

        let mut seen = Vec::new();
        while let Some(CoreEvent::Library(evt)) = rx.recv().await {
            match evt {
                LibraryEvent::DownloadProgress { percent, .. } => {
                    assert!(manager.update("a", percent));
                    seen.push(percent);
                }
                LibraryEvent::DownloadFinished { result, .. } => {
                    assert_eq!(result.unwrap(), "a.mp3");
                    manager.finish("a");
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(!seen.is_empty());
        assert!(!manager.is_active("a"));
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_dismiss_hides_progress() {
        let service = Arc::new(FakeService::default());
        let (tx, _rx) = mpsc::channel(16);
        let mut manager = DownloadManager::new();
        manager.start("a", service, tx).unwrap();
        assert_eq!(manager.snapshot().len(), 1);
        manager.dismiss("a");
        assert!(manager.snapshot().is_empty());
        assert!(!manager.update("a", 50.0));
        assert!(manager.is_active("a"));
    }
}
