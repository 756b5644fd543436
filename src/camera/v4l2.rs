use crate::camera::{CameraBackend, CameraInfo, FrameGrabber};
use crate::common::{AttendanceError, Result, config::CameraConfig};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};
use image::{ImageBuffer, ImageFormat, Luma, RgbImage, DynamicImage};
use std::fs;

pub struct V4l2Backend {
    config: CameraConfig,
}

impl V4l2Backend {
    pub fn new(config: &CameraConfig) -> Self {
        Self { config: config.clone() }
    }
}

impl CameraBackend for V4l2Backend {
    fn open(&self, device_index: u32) -> Result<Box<dyn FrameGrabber>> {
        let grabber = V4l2Grabber::open(device_index, &self.config)?;
        Ok(Box::new(grabber))
    }

    /// Scans /dev/video* for devices with video capture capability
    fn list_cameras(&self) -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();

        for entry in fs::read_dir("/dev")? {
            let entry = entry?;
            let path = entry.path();
            let filename = path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("");

            let Some(index) = filename.strip_prefix("video").and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(device) = Device::new(index as usize) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }

            let formats = device.enum_formats()
                .unwrap_or_default()
                .iter()
                .filter_map(|fmt| fmt.fourcc.str().ok().map(str::to_string))
                .collect();

            cameras.push(CameraInfo {
                index,
                name: caps.card.clone(),
                formats,
            });
        }

        cameras.sort_by_key(|c| c.index);
        Ok(cameras)
    }
}

pub struct V4l2Grabber {
    stream: Stream<'static>,
    fourcc: FourCC,
    width: u32,
    height: u32,
}

impl V4l2Grabber {
    pub fn open(index: u32, config: &CameraConfig) -> Result<Self> {
        tracing::info!("Opening camera device {}...", index);

        let device = Device::new(index as usize).map_err(|e| {
            tracing::warn!("Failed to open camera {}: {}", index, e);
            AttendanceError::DeviceUnavailable(index)
        })?;

        let mut fmt = device.format()
            .map_err(|e| AttendanceError::Camera(format!("Failed to get format: {}", e)))?;
        let b = config.fourcc.as_bytes();
        if b.len() != 4 {
            return Err(AttendanceError::Camera(format!("Invalid fourcc {:?}", config.fourcc)));
        }
        fmt.fourcc = FourCC::new(&[b[0], b[1], b[2], b[3]]);
        fmt.width = config.width;
        fmt.height = config.height;

        // The driver may clamp to the closest supported mode
        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let actual = device.format()
            .map_err(|e| AttendanceError::Camera(format!("Failed to get final format: {}", e)))?;

        if actual.width != config.width || actual.height != config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width, actual.height, config.width, config.height
            );
        }

        let stream = Stream::with_buffers(&device, Type::VideoCapture, 4).map_err(|e| {
            tracing::warn!("Failed to create stream on camera {}: {}", index, e);
            AttendanceError::DeviceUnavailable(index)
        })?;

        tracing::info!(
            "Camera {} open: {}x{} [{}]",
            index, actual.width, actual.height, actual.fourcc
        );

        Ok(Self {
            stream,
            fourcc: actual.fourcc,
            width: actual.width,
            height: actual.height,
        })
    }
}

impl FrameGrabber for V4l2Grabber {
    fn grab(&mut self) -> Result<RgbImage> {
        let (buf, _meta) = self.stream.next()
            .map_err(|e| AttendanceError::Camera(format!("Failed to capture: {}", e)))?;

        let fourcc = self.fourcc.str()
            .map_err(|_| AttendanceError::Camera("Invalid fourcc".into()))?;

        match fourcc {
            "MJPG" => {
                let img = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?;
                Ok(img.to_rgb8())
            }
            "YUYV" => Ok(yuyv_to_rgb(buf, self.width, self.height)),
            "GREY" => grey_to_rgb(buf, self.width, self.height),
            other => Err(AttendanceError::Camera(format!("Unsupported format {}", other))),
        }
    }
}

fn grey_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        return Err(AttendanceError::Camera("Short grayscale frame".into()));
    }
    let img_buffer = ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data[..expected].to_vec())
        .ok_or_else(|| AttendanceError::Camera("Failed to create grayscale image buffer".into()))?;

    Ok(DynamicImage::ImageLuma8(img_buffer).to_rgb8())
}

/// YUYV 4:2:2, each 4-byte block [Y0, U, Y1, V] encodes two pixels (BT.601).
fn yuyv_to_rgb(yuyv: &[u8], w: u32, h: u32) -> RgbImage {
    let mut out = RgbImage::new(w, h);

    for (i, chunk) in yuyv.chunks_exact(4).enumerate() {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        let pixel_idx = i as u32 * 2;
        let x = pixel_idx % w;
        let y = pixel_idx / w;
        if y >= h {
            break;
        }

        out.put_pixel(x, y, yuv_pixel(y0, u, v));
        if x + 1 < w {
            out.put_pixel(x + 1, y, yuv_pixel(y1, u, v));
        }
    }
    out
}

fn yuv_pixel(y: f32, u: f32, v: f32) -> image::Rgb<u8> {
    let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y - 0.344136 * u - 0.714136 * v).clamp(0.0, 255.0) as u8;
    let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    image::Rgb([r, g, b])
}
