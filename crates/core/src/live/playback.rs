//! Audio Playback Scheduler
//!
//! Each inbound speech segment starts at `max(device_time, next_start)` and
//! pushes `next_start` to its own end, so segments play back to back without
//! overlap and without gaps from delivery jitter. An interruption stops every
//! playing segment and restarts the time basis at zero.

use super::{AudioOutput, SegmentId};
use crate::audio::{PLAYBACK_SAMPLE_RATE, duration_secs};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    pub start: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start: f64,
    playing: HashSet<SegmentId>,
    next_id: SegmentId,
    spoken_secs: f64,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            next_start: 0.0,
            playing: HashSet::new(),
            next_id: 0,
            spoken_secs: 0.0,
        }
    }

    /// Schedules a segment of mono samples at the playback rate.
    pub fn schedule(&mut self, samples: Vec<f32>) -> ScheduledSegment {
        let duration = duration_secs(samples.len(), PLAYBACK_SAMPLE_RATE);
        let start = self.output.current_time().max(self.next_start);
        let id = self.next_id;
        self.next_id += 1;

        self.output.start_segment(id, samples, start);
        self.next_start = start + duration;
        self.playing.insert(id);
        self.spoken_secs += duration;
        debug!(id, start, duration, "Scheduled playback segment");

        ScheduledSegment {
            id,
            start,
            duration,
        }
    }

    /// Records the natural end of a segment. Returns true when this emptied
    /// the playing set.
    pub fn finish(&mut self, id: SegmentId) -> bool {
        self.playing.remove(&id) && self.playing.is_empty()
    }

    /// Stops and evicts every playing segment and resets the time basis.
    pub fn interrupt(&mut self) {
        for id in self.playing.drain() {
            self.output.stop_segment(id);
        }
        self.next_start = 0.0;
    }

    /// Stops everything and releases the output device.
    pub fn close(mut self) {
        self.interrupt();
        self.output.close();
    }

    pub fn playing_count(&self) -> usize {
        self.playing.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Total length of all speech scheduled so far, in seconds.
    pub fn spoken_secs(&self) -> f64 {
        self.spoken_secs
    }
}
