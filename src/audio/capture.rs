//! Microphone capture: frames the input into fixed 16 kHz windows, emits
//! base64-encoded PCM chunks, and publishes a voice-activity signal.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use crate::audio::codec;
use crate::error::{MediaAccessError, TutorError};

/// Samples per emitted chunk window.
pub const CAPTURE_WINDOW_SAMPLES: usize = 4096;

/// RMS energy above this counts as speech. Heuristic threshold, not
/// calibrated per device; tune here if a microphone reads hot or cold.
pub const SPEAKING_RMS_THRESHOLD: f32 = 0.01;

/// Fixed input boost applied before PCM conversion. Quiet laptop mics
/// otherwise transcribe poorly.
const INPUT_GAIN: f32 = 2.0;

/// Root-mean-square energy of one window.
fn rms(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = window.iter().map(|&s| (s as f64).powi(2)).sum();
    (sum_sq / window.len() as f64).sqrt() as f32
}

/// Linear-interpolation resampler between the device rate and 16 kHz.
fn resample_linear(samples: &[f32], ratio: f64) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let new_len = (samples.len() as f64 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx0 = src_idx as usize;
            let idx1 = (idx0 + 1).min(samples.len() - 1);
            let frac = src_idx - idx0 as f64;
            let s0 = samples[idx0] as f64;
            let s1 = samples[idx1] as f64;
            (s0 + (s1 - s0) * frac) as f32
        })
        .collect()
}

/// Accumulates resampled samples and hands out full fixed-size windows.
struct WindowFramer {
    pending: Vec<f32>,
    window: usize,
}

impl WindowFramer {
    fn new(window: usize) -> Self {
        WindowFramer {
            pending: Vec::new(),
            window,
        }
    }

    fn push(&mut self, samples: &[f32], mut emit: impl FnMut(&[f32])) {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.window {
            emit(&self.pending[..self.window]);
            self.pending.drain(..self.window);
        }
    }
}

struct CaptureWorker<F> {
    framer: WindowFramer,
    resample_ratio: f64,
    channels: usize,
    speaking: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    on_chunk: F,
}

impl<F: FnMut(String, &'static str)> CaptureWorker<F> {
    fn process(&mut self, data: &[f32]) {
        if self.stop.load(Ordering::Relaxed) {
            return;
        }

        // Downmix to mono and apply the input gain
        let mono: Vec<f32> = data
            .chunks(self.channels)
            .map(|frame| {
                let sum: f32 = frame.iter().sum();
                (sum / self.channels as f32) * INPUT_GAIN
            })
            .collect();

        let resampled = if (self.resample_ratio - 1.0).abs() > f64::EPSILON {
            resample_linear(&mono, self.resample_ratio)
        } else {
            mono
        };

        let speaking = &self.speaking;
        let level = &self.level;
        let on_chunk = &mut self.on_chunk;
        self.framer.push(&resampled, |window| {
            // The speaking observable updates on every window, whether or
            // not the chunk makes it out.
            let energy = rms(window);
            level.store(energy.to_bits(), Ordering::Relaxed);
            speaking.store(energy > SPEAKING_RMS_THRESHOLD, Ordering::Relaxed);

            let bytes = codec::pcm16_bytes_from_f32(window);
            on_chunk(codec::encode_base64(&bytes), codec::INPUT_AUDIO_MIME);
        });
    }
}

/// Live microphone capture. The cpal stream is released on `stop()` or drop.
pub struct CapturePipeline {
    stream: Option<cpal::Stream>,
    speaking: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
}

impl CapturePipeline {
    /// Acquire the default microphone and begin continuous capture.
    /// `on_chunk(base64, mime)` fires once per full window, on the audio
    /// callback thread.
    pub fn start<F>(on_chunk: F) -> Result<CapturePipeline, TutorError>
    where
        F: FnMut(String, &'static str) + Send + 'static,
    {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(TutorError::Permission(MediaAccessError::NotFound))?;
        let config = device
            .default_input_config()
            .map_err(|e| TutorError::from_device_error(e.to_string()))?;

        let sample_rate = config.sample_rate();
        let channels = config.channels() as usize;
        let resample_ratio = codec::INPUT_SAMPLE_RATE as f64 / sample_rate as f64;

        let speaking = Arc::new(AtomicBool::new(false));
        let level = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let mut worker = CaptureWorker {
            framer: WindowFramer::new(CAPTURE_WINDOW_SAMPLES),
            resample_ratio,
            channels,
            speaking: speaking.clone(),
            level: level.clone(),
            stop: stop.clone(),
            on_chunk,
        };

        let err_fn = |err| eprintln!("[Audio] Capture stream error: {}", err);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[f32], _: &_| worker.process(data),
                    err_fn,
                    None,
                )
                .map_err(|e| TutorError::from_device_error(e.to_string()))?,
            cpal::SampleFormat::I16 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[i16], _: &_| {
                        let floats: Vec<f32> =
                            data.iter().map(|&s| s as f32 / 32768.0).collect();
                        worker.process(&floats);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| TutorError::from_device_error(e.to_string()))?,
            other => {
                return Err(TutorError::Permission(MediaAccessError::Other(format!(
                    "unsupported sample format {:?}",
                    other
                ))))
            }
        };

        stream
            .play()
            .map_err(|e| TutorError::from_device_error(e.to_string()))?;

        Ok(CapturePipeline {
            stream: Some(stream),
            speaking,
            level,
            stop,
        })
    }

    /// Whether the last captured window exceeded the speech threshold.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    /// Last window's RMS energy, for level meters.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    /// Halt capture and release the device.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.stream.take();
        self.speaking.store(false, Ordering::Relaxed);
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_emits_only_full_windows_and_keeps_remainder() {
        let mut framer = WindowFramer::new(4);
        let mut windows: Vec<Vec<f32>> = Vec::new();

        framer.push(&[0.1, 0.2, 0.3], |w| windows.push(w.to_vec()));
        assert!(windows.is_empty());

        framer.push(&[0.4, 0.5], |w| windows.push(w.to_vec()));
        assert_eq!(windows, vec![vec![0.1, 0.2, 0.3, 0.4]]);

        framer.push(&[0.6, 0.7, 0.8, 0.9, 1.0], |w| windows.push(w.to_vec()));
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1], vec![0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn framer_emits_multiple_windows_from_one_push() {
        let mut framer = WindowFramer::new(2);
        let mut count = 0;
        framer.push(&[0.0; 7], |_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn rms_crosses_threshold_for_speech_level_signal() {
        let silence = vec![0.0f32; 1024];
        assert!(rms(&silence) < SPEAKING_RMS_THRESHOLD);

        // A quiet but audible tone: constant 0.05 amplitude
        let speech = vec![0.05f32; 1024];
        assert!(rms(&speech) > SPEAKING_RMS_THRESHOLD);
    }

    #[test]
    fn resample_halves_length_at_ratio_half() {
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let out = resample_linear(&input, 0.5);
        assert_eq!(out.len(), 50);
        // Interpolated values stay within the source range
        assert!(out.iter().all(|&s| (0.0..=99.0).contains(&s)));
    }

    #[test]
    fn resample_is_identity_safe_on_empty_input() {
        assert!(resample_linear(&[], 0.5).is_empty());
    }
}
