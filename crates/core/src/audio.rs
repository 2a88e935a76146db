use base64::Engine;

// Wire formats of the live session. Both directions are mono 16-bit PCM.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Decodes a base64 string representing PCM16 audio into a vector of f32 samples.
/// The function converts the string to a binary vector of u8, interprets chunks as i16 values,
/// and then normalizes them to f32 values between -1.0 and 1.0.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Vec<f32> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| {
                let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                (v as f32 / 32768.0).clamp(-1.0, 1.0)
            })
            .collect()
    } else {
        tracing::error!("Failed to decode base64 fragment to f32");
        Vec::new()
    }
}

/// Encodes a slice of f32 samples into a base64 string (converting to i16 PCM first).
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    let pcm16: Vec<u8> = convert_f32_to_i16(pcm32)
        .into_iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16)
}

/// Converts f32 samples to i16 with the capture scaling (x * 32768, saturating).
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Length in seconds of `samples` mono frames at `sample_rate`.
pub fn duration_secs(samples: usize, sample_rate: u32) -> f64 {
    samples as f64 / sample_rate as f64
}

/// Base64 for arbitrary bytes, e.g. an uploaded image.
pub fn encode_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
