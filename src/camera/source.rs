use crate::camera::{CameraBackend, Frame, FrameGrabber};
use crate::error::Result;
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;

/// Single-slot channel of the newest frame. Sending overwrites; a reader may
/// see a frame that has already been superseded, never a partially written one.
pub type FrameReceiver = watch::Receiver<Option<Arc<Frame>>>;

/// Owns a camera device and a background thread that keeps grabbing frames
/// into the latest-frame slot.
pub struct FrameSource {
    device_index: u32,
    frames: FrameReceiver,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn start(backend: &dyn CameraBackend, device_index: u32, retry_delay: Duration) -> Result<Self> {
        let grabber = backend.open(device_index)?;
        let (tx, frames) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name(format!("capture-{}", device_index))
                .spawn(move || capture_loop(grabber, tx, stop, retry_delay))?
        };

        tracing::info!("Frame source started on device {}", device_index);

        Ok(Self {
            device_index,
            frames,
            stop,
            worker: Some(worker),
        })
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Newest grabbed frame, or `None` before the first successful grab.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frames.borrow().clone()
    }

    /// Receiver for consumers that wait on new frames. It closes once the
    /// capture thread exits.
    pub fn subscribe(&self) -> FrameReceiver {
        self.frames.clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Signals the capture thread, waits for it and releases the device.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if worker.join().is_err() {
            tracing::error!("Capture thread for device {} panicked", self.device_index);
        }
        tracing::info!("Frame source on device {} stopped", self.device_index);
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut grabber: Box<dyn FrameGrabber>,
    tx: watch::Sender<Option<Arc<Frame>>>,
    stop: Arc<AtomicBool>,
    retry_delay: Duration,
) {
    let mut sequence = 0u64;
    let mut failures = 0u64;

    while !stop.load(Ordering::Acquire) {
        match grabber.grab() {
            Ok(image) => {
                if failures > 0 {
                    tracing::info!("Camera recovered after {} failed reads", failures);
                    failures = 0;
                }
                sequence += 1;
                tx.send_replace(Some(Arc::new(Frame {
                    image,
                    captured_at: Local::now(),
                    sequence,
                })));
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % 100 == 0 {
                    tracing::warn!("Failed to capture frame ({} consecutive): {}", failures, e);
                }
                std::thread::sleep(retry_delay);
            }
        }
    }
    // Dropping the grabber releases the device; dropping tx closes receivers.
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::CameraInfo;
    use crate::error::AttendanceError;
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Backend producing solid frames; every third read fails, every read
    /// when `broken`.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub opens: Arc<AtomicUsize>,
        pub unavailable: bool,
        pub broken: bool,
    }

    struct FakeGrabber {
        reads: u64,
        broken: bool,
    }

    impl FrameGrabber for FakeGrabber {
        fn grab(&mut self) -> Result<RgbImage> {
            self.reads += 1;
            std::thread::sleep(Duration::from_millis(2));
            if self.broken || self.reads % 3 == 0 {
                return Err(AttendanceError::Camera("flaky read".into()));
            }
            let shade = (self.reads % 255) as u8;
            Ok(RgbImage::from_pixel(8, 6, image::Rgb([shade, shade, shade])))
        }
    }

    impl CameraBackend for FakeBackend {
        fn open(&self, device_index: u32) -> Result<Box<dyn FrameGrabber>> {
            if self.unavailable {
                return Err(AttendanceError::DeviceUnavailable(device_index));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeGrabber { reads: 0, broken: self.broken }))
        }

        fn list_cameras(&self) -> Result<Vec<CameraInfo>> {
            Ok(vec![CameraInfo { index: 0, name: "fake".into(), formats: vec!["MJPG".into()] }])
        }
    }

    fn wait_for_frame(source: &FrameSource, min_sequence: u64) -> Arc<Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(frame) = source.latest_frame() {
                if frame.sequence >= min_sequence {
                    return frame;
                }
            }
            assert!(Instant::now() < deadline, "no frame within deadline");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn keeps_capturing_through_read_failures() {
        let backend = FakeBackend::default();
        let source = FrameSource::start(&backend, 0, Duration::from_millis(1)).unwrap();
        // Every third read fails, so reaching sequence 5 means failures were retried.
        let frame = wait_for_frame(&source, 5);
        assert_eq!(frame.image.dimensions(), (8, 6));
    }

    #[test]
    fn stop_is_idempotent_and_closes_subscribers() {
        let backend = FakeBackend::default();
        let mut source = FrameSource::start(&backend, 3, Duration::from_millis(1)).unwrap();
        let rx = source.subscribe();
        wait_for_frame(&source, 1);

        source.stop();
        source.stop();
        assert!(!source.is_running());
        assert!(rx.has_changed().is_err());
        assert_eq!(source.device_index(), 3);
    }

    #[test]
    fn unavailable_device_fails_start() {
        let backend = FakeBackend { unavailable: true, ..Default::default() };
        let result = FrameSource::start(&backend, 7, Duration::from_millis(1));
        assert!(matches!(result, Err(AttendanceError::DeviceUnavailable(7))));
    }
}
