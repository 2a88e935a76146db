use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Creates a mono resampler converting between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Resamples a finite buffer to exactly `round(len * ratio)` frames.
///
/// The resampler's output delay is skipped and the zero padding that
/// `process_partial` adds past the end is cut off, so a segment keeps its
/// nominal duration.
pub fn resample_all(resampler: &mut FastFixedIn<f32>, samples: &[f32], ratio: f64) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay);

    let mut rest = samples;
    while rest.len() >= resampler.input_frames_next() {
        let (chunk, tail) = rest.split_at(resampler.input_frames_next());
        match resampler.process(&[chunk], None) {
            Ok(res) => out.extend_from_slice(&res[0]),
            Err(e) => {
                tracing::warn!(error = %e, "Resampling failed; dropping chunk");
            }
        }
        rest = tail;
    }
    if !rest.is_empty() {
        let tail = [rest];
        match resampler.process_partial(Some(&tail[..]), None) {
            Ok(res) => out.extend_from_slice(&res[0]),
            Err(e) => tracing::warn!(error = %e, "Resampling tail failed"),
        }
    }
    // Flush the delay line with silence until the last input frame is out.
    for _ in 0..4 {
        if out.len() >= delay + expected {
            break;
        }
        match resampler.process_partial(None::<&[Vec<f32>]>, None) {
            Ok(res) => out.extend_from_slice(&res[0]),
            Err(e) => {
                tracing::warn!(error = %e, "Resampler flush failed");
                break;
            }
        }
    }

    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    out
}

/// Streaming resampler for device callbacks: buffers input until a full
/// chunk is available. A no-op when both rates match.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, chunk_size)?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    /// Feeds samples and returns whatever output is ready.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= resampler.input_frames_next() {
            let chunk: Vec<f32> = self.pending.drain(..resampler.input_frames_next()).collect();
            if let Ok(res) = resampler.process(&[chunk], None) {
                out.extend_from_slice(&res[0]);
            }
        }
        out
    }
}

/// Averages interleaved frames down to one channel.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
