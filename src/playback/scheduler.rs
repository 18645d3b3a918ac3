//! Playback Scheduler - lückenlose Wiedergabe eingehender Chunks
//!
//! Jeder dekodierte Puffer startet exakt dort, wo der vorherige endet
//! (`next_start_time`). Liegt der Cursor in der Vergangenheit, wird auf
//! die aktuelle Ausgabe-Uhr aufgeholt. Bei einer Unterbrechung werden alle
//! offenen Quellen gestoppt und der Cursor auf 0 gesetzt.

use super::output::{AudioError, AudioOutput, SourceId};
use crate::codec::AudioBuffer;
use std::collections::BTreeMap;

/// Eine auf der Ausgabe-Uhr geplante Quelle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Plant Puffer auf einem gemeinsamen Ausgabe-Kontext
pub struct PlaybackScheduler<O: AudioOutput> {
    output: Option<O>,
    next_start_time: f64,
    pending: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output: Some(output),
            next_start_time: 0.0,
            pending: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Plant einen Puffer direkt hinter den zuletzt geplanten
    pub fn schedule(&mut self, buffer: &AudioBuffer) -> Result<ScheduledSource, AudioError> {
        let output = self.output.as_mut().ok_or(AudioError::Closed)?;

        self.next_start_time = self.next_start_time.max(output.current_time());

        let id = self.next_id;
        self.next_id += 1;
        // Die Ausgabe kann inzwischen weitergelaufen sein
        let start_time = output.start_source(id, buffer, self.next_start_time)?;

        let source = ScheduledSource {
            id,
            start_time,
            duration: buffer.duration(),
        };
        self.next_start_time = source.end_time();
        self.pending.insert(id, source);

        tracing::debug!(
            "Scheduled source {} at {:.3}s (+{:.3}s), {} pending",
            id,
            source.start_time,
            source.duration,
            self.pending.len()
        );
        Ok(source)
    }

    /// Natürliches Ende einer Quelle
    pub fn source_ended(&mut self, id: SourceId) {
        if self.pending.remove(&id).is_some() {
            tracing::trace!("Source {} ended, {} pending", id, self.pending.len());
        }
    }

    /// Barge-in: alle offenen Quellen stoppen, Cursor zurücksetzen
    ///
    /// Gibt die Anzahl gestoppter Quellen zurück.
    pub fn interrupt(&mut self) -> usize {
        let stopped = std::mem::take(&mut self.pending);
        if let Some(output) = self.output.as_mut() {
            for id in stopped.keys() {
                if let Err(e) = output.stop_source(*id) {
                    tracing::debug!("Stopping source {} failed: {}", id, e);
                }
            }
        }
        self.next_start_time = 0.0;

        tracing::info!("Playback interrupted, {} sources stopped", stopped.len());
        stopped.len()
    }

    /// Stoppt alles und gibt den Ausgabe-Kontext frei. Idempotent.
    pub fn close(&mut self) -> Result<(), AudioError> {
        if self.output.is_none() {
            return Ok(());
        }
        self.interrupt();
        match self.output.take() {
            Some(mut output) => output.close(),
            None => Ok(()),
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ScheduledSource> {
        self.pending.values()
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_none()
    }

    pub fn current_time(&self) -> Option<f64> {
        self.output.as_ref().map(|o| o.current_time())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOutput;

    const EPS: f64 = 1e-9;

    fn chunk(seconds: f64) -> AudioBuffer {
        AudioBuffer::mono(vec![0.0; (seconds * 24000.0).round() as usize], 24000)
    }

    #[test]
    fn test_gapless_scenario_with_catch_up() {
        let output = FakeOutput::new();
        let clock = output.clock();
        let mut scheduler = PlaybackScheduler::new(output);

        clock.set(0.0);
        let a = scheduler.schedule(&chunk(0.5)).unwrap();
        clock.set(0.1);
        let b = scheduler.schedule(&chunk(0.3)).unwrap();
        clock.set(0.9);
        let c = scheduler.schedule(&chunk(0.4)).unwrap();

        assert!((a.start_time - 0.0).abs() < EPS);
        assert!((b.start_time - 0.5).abs() < EPS);
        assert!((c.start_time - 0.9).abs() < EPS);
        assert!((c.end_time() - 1.3).abs() < EPS);
        assert!((scheduler.next_start_time() - 1.3).abs() < EPS);
    }

    #[test]
    fn test_start_is_max_of_clock_and_previous_end() {
        let output = FakeOutput::new();
        let clock = output.clock();
        let mut scheduler = PlaybackScheduler::new(output);

        let arrivals = [
            (0.00, 0.20),
            (0.05, 0.10),
            (0.50, 0.25),
            (0.55, 0.05),
            (2.00, 0.30),
            (2.01, 0.30),
        ];

        let mut previous_end: Option<f64> = None;
        for (now, duration) in arrivals {
            clock.set(now);
            let source = scheduler.schedule(&chunk(duration)).unwrap();
            let expected = previous_end.map_or(now, |end| end.max(now));

            assert!((source.start_time - expected).abs() < EPS);
            if let Some(end) = previous_end {
                assert!(source.start_time >= end - EPS);
            }
            previous_end = Some(source.end_time());
        }
    }

    #[test]
    fn test_cursor_never_decreases_without_interrupt() {
        let output = FakeOutput::new();
        let clock = output.clock();
        let mut scheduler = PlaybackScheduler::new(output);

        let mut last = scheduler.next_start_time();
        for i in 0..20 {
            clock.set((i % 3) as f64 * 0.1);
            scheduler.schedule(&chunk(0.02)).unwrap();
            assert!(scheduler.next_start_time() >= last);
            last = scheduler.next_start_time();
        }
    }

    #[test]
    fn test_natural_end_removes_pending_source() {
        let output = FakeOutput::new();
        let mut scheduler = PlaybackScheduler::new(output);

        let a = scheduler.schedule(&chunk(0.1)).unwrap();
        let b = scheduler.schedule(&chunk(0.1)).unwrap();
        assert_eq!(scheduler.pending_len(), 2);

        scheduler.source_ended(a.id);
        assert_eq!(scheduler.pending_len(), 1);
        assert_eq!(scheduler.pending().next().unwrap().id, b.id);

        // doppeltes Ende ist harmlos
        scheduler.source_ended(a.id);
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[test]
    fn test_interrupt_stops_pending_and_resets_cursor() {
        let output = FakeOutput::new();
        let clock = output.clock();
        let log = output.log();
        let mut scheduler = PlaybackScheduler::new(output);

        let a = scheduler.schedule(&chunk(0.5)).unwrap();
        let b = scheduler.schedule(&chunk(0.5)).unwrap();
        assert_eq!(scheduler.pending_len(), 2);

        clock.set(0.3);
        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(scheduler.pending_len(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);

        let mut stopped = log.stopped();
        stopped.sort_unstable();
        assert_eq!(stopped, vec![a.id, b.id]);

        // Nächster Chunk startet relativ zur aktuellen Uhr, nicht bei 1.0
        let c = scheduler.schedule(&chunk(0.2)).unwrap();
        assert!((c.start_time - 0.3).abs() < EPS);
    }

    #[test]
    fn test_interrupt_after_natural_end_is_noop_for_finished_source() {
        let output = FakeOutput::new();
        let log = output.log();
        let mut scheduler = PlaybackScheduler::new(output);

        let a = scheduler.schedule(&chunk(0.1)).unwrap();
        scheduler.source_ended(a.id);

        assert_eq!(scheduler.interrupt(), 0);
        assert!(log.stopped().is_empty());
    }

    #[test]
    fn test_buffers_are_never_dropped() {
        let output = FakeOutput::new();
        let log = output.log();
        let mut scheduler = PlaybackScheduler::new(output);

        for _ in 0..50 {
            scheduler.schedule(&chunk(0.01)).unwrap();
        }
        assert_eq!(log.started().len(), 50);
        assert_eq!(scheduler.pending_len(), 50);
    }

    #[test]
    fn test_late_start_moves_cursor_with_it() {
        // Die Ausgabe rendert 50 ms zwischen Uhr-Abfrage und Start
        let output = FakeOutput::advancing_on_start(0.05);
        let mut scheduler = PlaybackScheduler::new(output);

        let a = scheduler.schedule(&chunk(0.5)).unwrap();
        let b = scheduler.schedule(&chunk(0.5)).unwrap();

        assert!((a.start_time - 0.05).abs() < EPS);
        assert!((b.start_time - a.end_time()).abs() < EPS);
        assert!((scheduler.next_start_time() - b.end_time()).abs() < EPS);
    }

    #[test]
    fn test_close_is_idempotent() {
        let output = FakeOutput::new();
        let log = output.log();
        let mut scheduler = PlaybackScheduler::new(output);

        scheduler.schedule(&chunk(0.2)).unwrap();
        scheduler.close().unwrap();
        scheduler.close().unwrap();

        assert_eq!(log.close_count(), 1);
        assert_eq!(log.stopped().len(), 1);
        assert!(scheduler.is_closed());
        assert!(matches!(
            scheduler.schedule(&chunk(0.1)),
            Err(AudioError::Closed)
        ));
    }
}
