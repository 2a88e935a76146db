//! Microphone capture through cpal.
//!
//! The stream runs at the device's native format. Each callback downmixes to
//! mono, resamples to the capture rate and, once resumed, reports the samples
//! to the bridge as `Captured` signals.

use crate::resample::{StreamResampler, downmix};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use mari_core::audio::CAPTURE_SAMPLE_RATE;
use mari_core::live::{AudioInput, EventSink, LiveError, SessionSignal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

const RESAMPLER_CHUNK: usize = 1024;

pub struct CpalMicrophone {
    stream: Option<cpal::Stream>,
    forwarding: Arc<AtomicBool>,
}

impl CpalMicrophone {
    /// Opens the named input device, or the default one.
    pub fn open(device_name: Option<&str>, sink: EventSink) -> Result<Self, LiveError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| LiveError::MicrophoneAccessDenied(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    LiveError::MicrophoneAccessDenied(format!("input device '{name}' not found"))
                })?,
            None => host
                .default_input_device()
                .ok_or_else(|| LiveError::MicrophoneAccessDenied("no input device".to_string()))?,
        };
        let config = device
            .default_input_config()
            .map_err(|e| LiveError::MicrophoneAccessDenied(e.to_string()))?;
        info!(
            device = %device.name().unwrap_or_else(|_| "<unknown>".into()),
            rate = config.sample_rate().0,
            channels = config.channels(),
            "Opening microphone"
        );

        let forwarding = Arc::new(AtomicBool::new(false));
        let stream_config: cpal::StreamConfig = config.clone().into();
        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &stream_config, forwarding.clone(), sink)
            }
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &stream_config, forwarding.clone(), sink)
            }
            cpal::SampleFormat::U16 => {
                build_stream::<u16>(&device, &stream_config, forwarding.clone(), sink)
            }
            other => Err(LiveError::AudioDevice(format!(
                "unsupported input sample format: {other:?}"
            ))),
        }?;
        stream
            .play()
            .map_err(|e| LiveError::MicrophoneAccessDenied(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            forwarding,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    forwarding: Arc<AtomicBool>,
    sink: EventSink,
) -> Result<cpal::Stream, LiveError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut resampler =
        StreamResampler::new(config.sample_rate.0, CAPTURE_SAMPLE_RATE, RESAMPLER_CHUNK)
            .map_err(|e| LiveError::AudioDevice(e.to_string()))?;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !forwarding.load(Ordering::Acquire) {
                    return;
                }
                let interleaved: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                let samples = resampler.push(&downmix(&interleaved, channels));
                if !samples.is_empty() {
                    sink.emit(SessionSignal::Captured(samples));
                }
            },
            |err| warn!("cpal input stream error: {err}"),
            None,
        )
        .map_err(|e| LiveError::MicrophoneAccessDenied(e.to_string()))
}

impl AudioInput for CpalMicrophone {
    fn resume(&mut self) -> Result<(), LiveError> {
        if self.stream.is_none() {
            return Err(LiveError::AudioDevice("microphone already stopped".to_string()));
        }
        self.forwarding.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.forwarding.store(false, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            info!("Microphone released");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}
