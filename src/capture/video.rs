//! Video-Kadenz - ein komprimiertes Standbild pro Intervall

use super::CaptureEvent;
use crate::codec::{encode_jpeg_base64, RgbFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Oberfläche, die das aktuelle Kamerabild liefert
///
/// Die Vorschau gehört dem Aufrufer; solange noch kein Bild vorliegt,
/// gibt `grab_frame` `None` zurück und der Zyklus wird übersprungen.
pub trait VideoSurface: Send + Sync {
    fn grab_frame(&self) -> Option<RgbFrame>;
}

/// Periodischer Frame-Grabber
pub struct VideoCadence {
    handle: Option<JoinHandle<()>>,
}

impl VideoCadence {
    /// Startet den Timer; das erste Bild wird nach einem vollen Intervall gesendet
    pub fn start(
        surface: Arc<dyn VideoSurface>,
        interval: Duration,
        quality: u8,
        events_tx: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(frame) = surface.grab_frame() else {
                    tracing::trace!("Video surface not ready, skipping frame");
                    continue;
                };

                let encoded =
                    tokio::task::spawn_blocking(move || encode_jpeg_base64(frame, quality)).await;

                let data = match encoded {
                    Ok(Ok(data)) => data,
                    Ok(Err(e)) => {
                        tracing::warn!("Failed to encode video frame: {}", e);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Video encode task failed: {}", e);
                        continue;
                    }
                };

                if events_tx.send(CaptureEvent::Video(data)).is_err() {
                    tracing::debug!("Capture receiver gone, stopping video cadence");
                    break;
                }
            }
        });

        Self {
            handle: Some(handle),
        }
    }

    /// Bricht den Timer ab; `false` wenn er bereits gestoppt war
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for VideoCadence {
    fn drop(&mut self) {
        self.stop();
    }
}
