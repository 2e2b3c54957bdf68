//! Playback scheduling for model audio: incoming chunks are pinned
//! back-to-back on an output timeline so speech plays without gaps, and an
//! interruption drain cuts everything off at once.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crate::audio::codec::{self, PlayableBuffer};
use crate::error::TutorError;

/// Monotonic cursor over the output timeline, in seconds.
struct Timeline {
    next_start: f64,
}

impl Timeline {
    fn new() -> Self {
        Timeline { next_start: 0.0 }
    }

    /// Pin a chunk of `duration` seconds to the timeline: it starts at the
    /// end of the previous chunk, or at `now` if playback had stalled.
    fn schedule(&mut self, now: f64, duration: f64) -> f64 {
        let start = now.max(self.next_start);
        self.next_start = start + duration;
        start
    }

    fn reset(&mut self) {
        self.next_start = 0.0;
    }
}

/// One scheduled chunk, tracked until its samples have all been rendered.
struct ChunkToken {
    remaining: usize,
}

struct PlaybackState {
    /// Samples awaiting output, already resampled to the device rate.
    queue: VecDeque<i16>,
    active: VecDeque<ChunkToken>,
    timeline: Timeline,
    /// Output clock: frames rendered since the stream started.
    played: u64,
    device_rate: u32,
}

impl PlaybackState {
    fn new(device_rate: u32) -> Self {
        PlaybackState {
            queue: VecDeque::new(),
            active: VecDeque::new(),
            timeline: Timeline::new(),
            played: 0,
            device_rate,
        }
    }

    fn clock(&self) -> f64 {
        self.played as f64 / self.device_rate as f64
    }

    /// Render one output frame. The clock advances whether or not data is
    /// queued; silence plays during stalls.
    fn next_frame(&mut self) -> i16 {
        self.played += 1;
        match self.queue.pop_front() {
            Some(sample) => {
                if let Some(token) = self.active.front_mut() {
                    token.remaining -= 1;
                    if token.remaining == 0 {
                        self.active.pop_front();
                    }
                }
                sample
            }
            None => 0,
        }
    }
}

/// Nearest-sample linear resampler for the 24 kHz model rate → device rate.
fn resample_i16(samples: &[i16], ratio: f64) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }
    if (ratio - 1.0).abs() < f64::EPSILON {
        return samples.to_vec();
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
            (s0 + (s1 - s0) * frac) as i16
        })
        .collect()
}

/// Schedules decoded model audio for gapless output.
pub struct PlaybackScheduler {
    shared: Arc<Mutex<PlaybackState>>,
    speaking: Arc<AtomicBool>,
    stream: Option<cpal::Stream>,
    paused: bool,
}

impl PlaybackScheduler {
    /// Open the default output device. A machine without one still gets a
    /// working scheduler; audio is consumed by the clockless queue and the
    /// session carries on without sound.
    pub fn start() -> PlaybackScheduler {
        let host = cpal::default_host();
        let device = match host.default_output_device() {
            Some(d) => d,
            None => {
                eprintln!("[Audio] No output device found; model audio will be silent");
                return PlaybackScheduler::detached();
            }
        };
        let config = match device.default_output_config() {
            Ok(c) => c,
            Err(e) => {
                eprintln!("[Audio] No usable output config: {}; model audio will be silent", e);
                return PlaybackScheduler::detached();
            }
        };

        let device_rate = config.sample_rate();
        let channels = config.channels() as usize;

        let shared = Arc::new(Mutex::new(PlaybackState::new(device_rate)));
        let speaking = Arc::new(AtomicBool::new(false));

        let cb_shared = shared.clone();
        let cb_speaking = speaking.clone();
        let err_fn = |err| eprintln!("[Audio] Playback stream error: {}", err);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => device.build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut state = cb_shared.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let value = state.next_frame() as f32 / 32768.0;
                        for channel in frame.iter_mut() {
                            *channel = value;
                        }
                    }
                    if state.active.is_empty() {
                        cb_speaking.store(false, Ordering::Relaxed);
                    }
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_output_stream(
                &config.into(),
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut state = cb_shared.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let value = state.next_frame();
                        for channel in frame.iter_mut() {
                            *channel = value;
                        }
                    }
                    if state.active.is_empty() {
                        cb_speaking.store(false, Ordering::Relaxed);
                    }
                },
                err_fn,
                None,
            ),
            other => {
                eprintln!("[Audio] Unsupported output format {:?}; model audio will be silent", other);
                return PlaybackScheduler::detached();
            }
        };

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("[Audio] Failed to open playback stream: {}", e);
                return PlaybackScheduler::detached();
            }
        };
        if let Err(e) = stream.play() {
            eprintln!("[Audio] Failed to start playback stream: {}", e);
        }

        PlaybackScheduler {
            shared,
            speaking,
            stream: Some(stream),
            paused: false,
        }
    }

    /// Scheduler with no output stream; used when no device exists and by
    /// the timeline tests.
    fn detached() -> PlaybackScheduler {
        PlaybackScheduler {
            shared: Arc::new(Mutex::new(PlaybackState::new(codec::OUTPUT_SAMPLE_RATE))),
            speaking: Arc::new(AtomicBool::new(false)),
            stream: None,
            paused: false,
        }
    }

    /// Decode one base64 PCM chunk and pin it after the last scheduled one.
    /// Returns the scheduled start time on the output timeline.
    pub fn enqueue(&self, base64: &str) -> Result<f64, TutorError> {
        let buffer = PlayableBuffer::from_base64(base64, codec::OUTPUT_SAMPLE_RATE)?;
        let duration = buffer.duration_secs();

        let mut state = self.shared.lock().unwrap();
        let ratio = state.device_rate as f64 / codec::OUTPUT_SAMPLE_RATE as f64;
        let device_samples = resample_i16(&buffer.samples, ratio);

        let now = state.clock();
        let start = state.timeline.schedule(now, duration);
        state.active.push_back(ChunkToken {
            remaining: device_samples.len(),
        });
        state.queue.extend(device_samples);
        drop(state);

        self.speaking.store(true, Ordering::Relaxed);
        Ok(start)
    }

    /// Hard interruption: stop every scheduled chunk, clear the active set,
    /// and reset the timeline cursor so the next chunk starts at "now".
    pub fn drain(&self) {
        let mut state = self.shared.lock().unwrap();
        state.queue.clear();
        state.active.clear();
        state.timeline.reset();
        drop(state);
        self.speaking.store(false, Ordering::Relaxed);
    }

    /// Suspend output without discarding scheduled audio.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.pause() {
                eprintln!("[Audio] Pause failed: {}", e);
                return;
            }
        }
        self.paused = true;
    }

    /// Resume output after a pause.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.play() {
                eprintln!("[Audio] Resume failed: {}", e);
                return;
            }
        }
        self.paused = false;
    }

    /// Whether any model audio is scheduled or playing.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn active_len(&self) -> usize {
        self.shared.lock().unwrap().active.len()
    }

    /// Current timeline cursor (end of the last scheduled chunk), seconds.
    #[cfg(test)]
    fn cursor(&self) -> f64 {
        self.shared.lock().unwrap().timeline.next_start
    }

    #[cfg(test)]
    fn advance(&self, frames: usize) {
        let mut state = self.shared.lock().unwrap();
        for _ in 0..frames {
            state.next_frame();
        }
        if state.active.is_empty() {
            self.speaking.store(false, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{encode_base64, pcm16_bytes_from_f32};

    fn chunk_of(seconds: f64) -> String {
        let samples = (seconds * codec::OUTPUT_SAMPLE_RATE as f64) as usize;
        encode_base64(&pcm16_bytes_from_f32(&vec![0.1; samples]))
    }

    #[test]
    fn chunks_schedule_back_to_back() {
        let scheduler = PlaybackScheduler::detached();
        let t1 = scheduler.enqueue(&chunk_of(0.5)).unwrap();
        let t2 = scheduler.enqueue(&chunk_of(0.25)).unwrap();
        let t3 = scheduler.enqueue(&chunk_of(1.0)).unwrap();

        assert_eq!(t1, 0.0);
        assert!((t2 - 0.5).abs() < 1e-9);
        assert!((t3 - 0.75).abs() < 1e-9);
        assert!((scheduler.cursor() - 1.75).abs() < 1e-9);
        assert_eq!(scheduler.active_len(), 3);
        assert!(scheduler.is_speaking());
    }

    #[test]
    fn stalled_playback_pins_next_chunk_to_now() {
        let scheduler = PlaybackScheduler::detached();
        scheduler.enqueue(&chunk_of(0.1)).unwrap();

        // Render past the end of the chunk: the clock runs ahead of the cursor
        scheduler.advance(codec::OUTPUT_SAMPLE_RATE as usize);
        assert_eq!(scheduler.active_len(), 0);
        assert!(!scheduler.is_speaking());

        let start = scheduler.enqueue(&chunk_of(0.1)).unwrap();
        assert!((start - 1.0).abs() < 1e-9, "start {} should be the clock, not the old cursor", start);
    }

    #[test]
    fn drain_empties_active_set_and_resets_cursor() {
        let scheduler = PlaybackScheduler::detached();
        scheduler.enqueue(&chunk_of(0.5)).unwrap();
        scheduler.enqueue(&chunk_of(0.5)).unwrap();
        assert_eq!(scheduler.active_len(), 2);

        scheduler.drain();
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(scheduler.cursor(), 0.0);
        assert!(!scheduler.is_speaking());

        // Next chunk starts at "now", not at the old cursor
        let start = scheduler.enqueue(&chunk_of(0.5)).unwrap();
        assert_eq!(start, 0.0);
    }

    #[test]
    fn natural_completion_clears_speaking_without_resetting_cursor() {
        let scheduler = PlaybackScheduler::detached();
        scheduler.enqueue(&chunk_of(0.2)).unwrap();
        let samples = (0.2 * codec::OUTPUT_SAMPLE_RATE as f64) as usize;
        scheduler.advance(samples);

        assert_eq!(scheduler.active_len(), 0);
        assert!(!scheduler.is_speaking());
        assert!((scheduler.cursor() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn malformed_chunk_is_rejected_and_state_untouched() {
        let scheduler = PlaybackScheduler::detached();
        assert!(scheduler.enqueue("@@@").is_err());
        assert_eq!(scheduler.active_len(), 0);
        assert_eq!(scheduler.cursor(), 0.0);
        assert!(!scheduler.is_speaking());
    }
}
