//! Native audio for the live session: cpal microphone and speaker wrapped
//! behind the bridge's device traits, plus the rubato resampling helpers.
//!
//! cpal streams are not `Send` on every platform, so these devices must stay
//! on the thread that drives the bridge.

pub mod microphone;
pub mod resample;
pub mod speaker;

pub use microphone::CpalMicrophone;
pub use speaker::CpalSpeaker;

use cpal::traits::{DeviceTrait, HostTrait};
use mari_core::live::{AudioInput, AudioOutput, EventSink, LiveDevices, LiveError};

/// Opens the configured (or default) cpal devices for each live session.
#[derive(Debug, Clone, Default)]
pub struct CpalDevices {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl CpalDevices {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

impl LiveDevices for CpalDevices {
    fn open_microphone(&mut self, sink: EventSink) -> Result<Box<dyn AudioInput>, LiveError> {
        Ok(Box::new(CpalMicrophone::open(
            self.input_device.as_deref(),
            sink,
        )?))
    }

    fn open_output(&mut self, sink: EventSink) -> Result<Box<dyn AudioOutput>, LiveError> {
        Ok(Box::new(CpalSpeaker::open(
            self.output_device.as_deref(),
            sink,
        )?))
    }
}

/// Names of the available input and output devices.
pub fn list_devices() -> anyhow::Result<(Vec<String>, Vec<String>)> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()?
        .filter_map(|d| d.name().ok())
        .collect();
    let outputs = host
        .output_devices()?
        .filter_map(|d| d.name().ok())
        .collect();
    Ok((inputs, outputs))
}
