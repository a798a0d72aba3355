//! Per-camera latest-frame buffer with an atomic snapshot-and-clear.

use crate::camera::CameraId;
use crate::frame::{DecodeError, FrameDecoder, PixelBuffer};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum timestamp spread (seconds) of a set before it is flagged.
    pub tolerance_seconds: f64,
    /// How long `wait_for_cameras` blocks for missing cameras.
    pub wait_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            tolerance_seconds: 1.0 / 60.0,
            wait_timeout_ms: 100,
        }
    }
}

impl SyncConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Camera {camera_id} is not part of a {camera_count}-camera rig")]
    UnknownCamera {
        camera_id: CameraId,
        camera_count: usize,
    },
    #[error("Camera {camera_id}: {source}")]
    Decode {
        camera_id: CameraId,
        source: DecodeError,
    },
}

#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub image: PixelBuffer,
    /// Capture time in seconds.
    pub timestamp: f64,
}

/// Frames drained from the buffer in one window.
#[derive(Debug, Clone, Default)]
pub struct SynchronizedFrameSet {
    pub frames: BTreeMap<CameraId, TimedFrame>,
    /// Cameras whose latest submission in this window failed to decode.
    pub decode_failures: Vec<(CameraId, DecodeError)>,
    pub tolerance_seconds: f64,
}

impl SynchronizedFrameSet {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.frames.keys().copied().collect()
    }

    pub fn get(&self, camera_id: CameraId) -> Option<&TimedFrame> {
        self.frames.get(&camera_id)
    }

    /// `max(ts) - min(ts)` over the frames; zero for fewer than two frames.
    pub fn timestamp_spread(&self) -> f64 {
        let mut timestamps = self.frames.values().map(|f| f.timestamp);
        let Some(first) = timestamps.next() else {
            return 0.0;
        };
        let (min, max) = timestamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
        max - min
    }

    /// The spread, if it exceeds the tolerance.
    pub fn sync_warning(&self) -> Option<f64> {
        let spread = self.timestamp_spread();
        (spread > self.tolerance_seconds).then_some(spread)
    }
}

#[derive(Default)]
struct BufferState {
    frames: BTreeMap<CameraId, TimedFrame>,
    failures: BTreeMap<CameraId, DecodeError>,
}

impl BufferState {
    fn reported(&self, camera_id: CameraId) -> bool {
        self.frames.contains_key(&camera_id) || self.failures.contains_key(&camera_id)
    }
}

/// Latest frame per camera, shared between submitting threads and the consumer.
pub struct FrameSyncBuffer {
    state: Mutex<BufferState>,
    arrived: Condvar,
    decoder: Arc<dyn FrameDecoder>,
    camera_count: usize,
    config: SyncConfig,
}

impl FrameSyncBuffer {
    pub fn new(camera_count: usize, decoder: Arc<dyn FrameDecoder>, config: SyncConfig) -> Self {
        FrameSyncBuffer {
            state: Mutex::new(BufferState::default()),
            arrived: Condvar::new(),
            decoder,
            camera_count,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Decodes `bytes` and stores the frame, replacing an older frame of the same camera.
    ///
    /// Decoding happens before the lock is taken. A failed decode removes any
    /// older frame of that camera from the window and is reported both to the
    /// caller and in the next drained set.
    pub fn submit(&self, camera_id: CameraId, bytes: &[u8], timestamp: f64) -> Result<(), FrameError> {
        if camera_id >= self.camera_count {
            return Err(FrameError::UnknownCamera {
                camera_id,
                camera_count: self.camera_count,
            });
        }

        let decoded = self.decoder.decode(bytes);

        let mut state = self.state.lock();
        let result = match decoded {
            Ok(image) => {
                state.failures.remove(&camera_id);
                state.frames.insert(camera_id, TimedFrame { image, timestamp });
                debug!("Camera {} frame buffered at t = {:.6} s", camera_id, timestamp);
                Ok(())
            }
            Err(source) => {
                warn!("Camera {} frame failed to decode: {}", camera_id, source);
                state.frames.remove(&camera_id);
                state.failures.insert(camera_id, source.clone());
                Err(FrameError::Decode { camera_id, source })
            }
        };
        drop(state);
        self.arrived.notify_all();
        result
    }

    /// Snapshots and clears the buffer in one step.
    pub fn drain(&self) -> SynchronizedFrameSet {
        let mut state = self.state.lock();
        self.take(&mut state)
    }

    /// Blocks until every camera in `expected` has reported (a frame or a decode
    /// failure) or `timeout` elapses, then drains whatever is present.
    pub fn wait_for_cameras(&self, expected: &[CameraId], timeout: Duration) -> SynchronizedFrameSet {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !expected.iter().all(|&id| state.reported(id)) {
            if self.arrived.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let missing: Vec<CameraId> = expected
            .iter()
            .copied()
            .filter(|&id| !state.reported(id))
            .collect();
        if !missing.is_empty() {
            debug!("Frame wait timed out; missing cameras {:?}", missing);
        }
        self.take(&mut state)
    }

    fn take(&self, state: &mut BufferState) -> SynchronizedFrameSet {
        let taken = std::mem::take(state);
        let set = SynchronizedFrameSet {
            frames: taken.frames,
            decode_failures: taken.failures.into_iter().collect(),
            tolerance_seconds: self.config.tolerance_seconds,
        };
        if let Some(spread) = set.sync_warning() {
            warn!(
                "Frame set spread {:.3} ms exceeds the {:.3} ms tolerance",
                spread * 1e3,
                self.config.tolerance_seconds * 1e3
            );
        }
        set
    }

    /// Drops every buffered frame and failure.
    pub fn clear(&self) {
        *self.state.lock() = BufferState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ImageDecoder;
    use crate::test_utils::{encode_png, textured_image};
    use std::thread;

    fn buffer(cameras: usize) -> FrameSyncBuffer {
        FrameSyncBuffer::new(cameras, Arc::new(ImageDecoder), SyncConfig::default())
    }

    fn png() -> Vec<u8> {
        encode_png(&textured_image(16, 12, 0.0, 3))
    }

    #[test]
    fn test_frames_within_tolerance() {
        let buffer = buffer(2);
        buffer.submit(0, &png(), 10.000).unwrap();
        buffer.submit(1, &png(), 10.005).unwrap();

        let set = buffer.drain();
        assert_eq!(set.camera_ids(), vec![0, 1]);
        assert!((set.timestamp_spread() - 0.005).abs() < 1e-9);
        assert!(set.sync_warning().is_none());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_frames_outside_tolerance_are_kept_and_flagged() {
        let buffer = buffer(2);
        buffer.submit(0, &png(), 3.00).unwrap();
        buffer.submit(1, &png(), 3.05).unwrap();

        let set = buffer.drain();
        assert_eq!(set.len(), 2);
        assert!(set.sync_warning().is_some());
    }

    #[test]
    fn test_newer_frame_replaces_older() {
        let buffer = buffer(1);
        buffer.submit(0, &png(), 1.0).unwrap();
        buffer.submit(0, &png(), 2.0).unwrap();
        let set = buffer.drain();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(0).unwrap().timestamp, 2.0);
    }

    #[test]
    fn test_decode_failure_is_recorded() {
        let buffer = buffer(3);
        buffer.submit(0, &png(), 0.0).unwrap();
        buffer.submit(1, &png(), 0.001).unwrap();
        let err = buffer.submit(2, b"not an image", 0.002).unwrap_err();
        assert!(matches!(err, FrameError::Decode { camera_id: 2, .. }));

        let set = buffer.drain();
        assert_eq!(set.camera_ids(), vec![0, 1]);
        assert_eq!(set.decode_failures.len(), 1);
        assert_eq!(set.decode_failures[0].0, 2);

        assert!(matches!(
            buffer.submit(3, &png(), 0.0),
            Err(FrameError::UnknownCamera { camera_id: 3, camera_count: 3 })
        ));
    }

    #[test]
    fn test_concurrent_submissions() {
        let buffer = Arc::new(buffer(4));
        let bytes = png();
        let handles: Vec<_> = (0..4)
            .map(|camera| {
                let buffer = Arc::clone(&buffer);
                let bytes = bytes.clone();
                thread::spawn(move || {
                    for k in 0..5 {
                        buffer.submit(camera, &bytes, k as f64 * 0.001).unwrap();
                    }
                })
            })
            .collect();

        let set = buffer.wait_for_cameras(&[0, 1, 2, 3], Duration::from_secs(10));
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.len(), 4);
        assert!(set.decode_failures.is_empty());
    }

    #[test]
    fn test_wait_times_out_with_partial_set() {
        let buffer = buffer(2);
        buffer.submit(0, &png(), 0.0).unwrap();
        let started = Instant::now();
        let set = buffer.wait_for_cameras(&[0, 1], Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(set.camera_ids(), vec![0]);
    }
}
