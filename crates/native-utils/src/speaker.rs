//! Speaker output through cpal.
//!
//! One output stream stays open for the whole session. Segments are mixed
//! into it at their scheduled frame, and the frame counter doubles as the
//! device clock the playback scheduler reads.

use crate::resample::{create_resampler, resample_all};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use mari_core::audio::PLAYBACK_SAMPLE_RATE;
use mari_core::live::{AudioOutput, EventSink, LiveError, SegmentId, SessionSignal};
use rubato::Resampler;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const RESAMPLER_CHUNK: usize = 1024;

struct Voice {
    id: SegmentId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Shared between the output callback and the scheduler side.
#[derive(Default)]
pub(crate) struct Timeline {
    frames_played: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    /// Mixes the next `out.len() / channels` frames and returns the segments
    /// that finished within them.
    pub(crate) fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<SegmentId> {
        let channels = channels.max(1);
        for frame in out.chunks_mut(channels) {
            let now = self.frames_played;
            let mut value = 0.0f32;
            for voice in &self.voices {
                if now >= voice.start_frame && now < voice.end_frame() {
                    value += voice.samples[(now - voice.start_frame) as usize];
                }
            }
            frame.fill(value.clamp(-1.0, 1.0));
            self.frames_played += 1;
        }

        let now = self.frames_played;
        let mut finished = Vec::new();
        self.voices.retain(|voice| {
            if voice.end_frame() <= now {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
        finished
    }

    pub(crate) fn add(&mut self, id: SegmentId, start_frame: u64, samples: Vec<f32>) {
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    pub(crate) fn remove(&mut self, id: SegmentId) {
        self.voices.retain(|voice| voice.id != id);
    }

    pub(crate) fn clear(&mut self) {
        self.voices.clear();
    }

    pub(crate) fn frames_played(&self) -> u64 {
        self.frames_played
    }
}

pub struct CpalSpeaker {
    stream: Option<cpal::Stream>,
    timeline: Arc<Mutex<Timeline>>,
    device_rate: u32,
    resampler: Option<rubato::FastFixedIn<f32>>,
}

impl CpalSpeaker {
    /// Opens the named output device, or the default one.
    pub fn open(device_name: Option<&str>, sink: EventSink) -> Result<Self, LiveError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| LiveError::AudioDevice(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| LiveError::AudioDevice(format!("output device '{name}' not found")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| LiveError::AudioDevice("no output device".to_string()))?,
        };
        let config = device
            .default_output_config()
            .map_err(|e| LiveError::AudioDevice(e.to_string()))?;
        let device_rate = config.sample_rate().0;
        info!(
            device = %device.name().unwrap_or_else(|_| "<unknown>".into()),
            rate = device_rate,
            channels = config.channels(),
            "Opening speaker"
        );

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let stream_config: cpal::StreamConfig = config.clone().into();
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &stream_config, timeline.clone(), sink)
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, timeline.clone(), sink)
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &stream_config, timeline.clone(), sink)
            }
            other => Err(LiveError::AudioDevice(format!(
                "unsupported output sample format: {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| LiveError::AudioDevice(e.to_string()))?;

        let resampler = if device_rate == PLAYBACK_SAMPLE_RATE {
            None
        } else {
            Some(
                create_resampler(
                    PLAYBACK_SAMPLE_RATE as f64,
                    device_rate as f64,
                    RESAMPLER_CHUNK,
                )
                .map_err(|e| LiveError::AudioDevice(e.to_string()))?,
            )
        };

        Ok(Self {
            stream: Some(stream),
            timeline,
            device_rate,
            resampler,
        })
    }

    fn timeline(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    sink: EventSink,
) -> Result<cpal::Stream, LiveError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mix = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mix.resize(data.len(), 0.0f32);
                let finished = {
                    let mut timeline = timeline.lock().unwrap_or_else(|e| e.into_inner());
                    timeline.render(&mut mix, channels)
                };
                for (out, &value) in data.iter_mut().zip(mix.iter()) {
                    *out = T::from_sample(value);
                }
                for id in finished {
                    sink.emit(SessionSignal::SegmentEnded(id));
                }
            },
            |err| warn!("cpal output stream error: {err}"),
            None,
        )
        .map_err(|e| LiveError::AudioDevice(e.to_string()))
}

impl AudioOutput for CpalSpeaker {
    fn current_time(&self) -> f64 {
        self.timeline().frames_played() as f64 / self.device_rate as f64
    }

    fn start_segment(&mut self, id: SegmentId, samples: Vec<f32>, at: f64) {
        let samples = match self.resampler.as_mut() {
            Some(resampler) => {
                resampler.reset();
                resample_all(
                    resampler,
                    &samples,
                    self.device_rate as f64 / PLAYBACK_SAMPLE_RATE as f64,
                )
            }
            None => samples,
        };
        let start_frame = (at * self.device_rate as f64).round().max(0.0) as u64;
        debug!(id, start_frame, frames = samples.len(), "Queueing segment");
        self.timeline().add(id, start_frame, samples);
    }

    fn stop_segment(&mut self, id: SegmentId) {
        self.timeline().remove(id);
    }

    fn close(&mut self) {
        self.timeline().clear();
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            info!("Speaker released");
        }
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_render_mixes_at_scheduled_frame() {
        let mut timeline = Timeline::default();
        timeline.add(1, 2, vec![0.5, 0.5]);

        let mut out = vec![9.0; 4];
        let finished = timeline.render(&mut out, 1);

        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert_eq!(finished, vec![1]);
        assert_eq!(timeline.frames_played(), 4);
    }

    #[test]
    fn test_render_duplicates_mono_across_channels() {
        let mut timeline = Timeline::default();
        timeline.add(7, 0, vec![0.25, -0.25, 0.1]);

        let mut out = vec![0.0; 4];
        let finished = timeline.render(&mut out, 2);

        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
        assert!(finished.is_empty());

        let mut out = vec![0.0; 2];
        assert_eq!(timeline.render(&mut out, 2), vec![7]);
        assert_abs_diff_eq!(out[0], 0.1);
    }

    #[test]
    fn test_overlapping_voices_are_summed_and_clamped() {
        let mut timeline = Timeline::default();
        timeline.add(1, 0, vec![0.75; 2]);
        timeline.add(2, 1, vec![0.75; 2]);

        let mut out = vec![0.0; 3];
        let finished = timeline.render(&mut out, 1);

        assert_eq!(out, vec![0.75, 1.0, 0.75]);
        assert_eq!(finished, vec![1, 2]);
    }

    #[test]
    fn test_removed_voice_never_reports_end() {
        let mut timeline = Timeline::default();
        timeline.add(3, 0, vec![0.5; 2]);
        timeline.remove(3);

        let mut out = vec![0.0; 4];
        assert!(timeline.render(&mut out, 1).is_empty());
        assert_eq!(out, vec![0.0; 4]);
    }
}
