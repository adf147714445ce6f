use crate::camera::{FramePoll, FrameSource};
use crate::common::{config::CameraConfig, KioskError, Result};
use crate::core::types::{CameraId, Frame};
use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Last buffer pulled off the device, kept undecoded until someone asks.
#[derive(Clone)]
struct RawFrame {
    data: Vec<u8>,
    fourcc: [u8; 4],
    width: u32,
    height: u32,
    captured_at: DateTime<Utc>,
}

struct CameraFeed {
    latest: Arc<Mutex<Option<RawFrame>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// One streaming thread per camera, each overwriting a single latest-frame
/// slot. Readers never block on the device.
pub struct V4l2FrameSource {
    feeds: HashMap<CameraId, CameraFeed>,
}

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
    pub can_capture: bool,
}

impl V4l2FrameSource {
    pub fn open(cameras: &[CameraConfig]) -> Result<Self> {
        let mut feeds = HashMap::new();

        for config in cameras {
            let latest = Arc::new(Mutex::new(None));
            let stop = Arc::new(AtomicBool::new(false));
            let worker = {
                let config = config.clone();
                let latest = Arc::clone(&latest);
                let stop = Arc::clone(&stop);
                std::thread::Builder::new()
                    .name(format!("camera-{}", config.id))
                    .spawn(move || capture_worker(config, latest, stop))?
            };

            feeds.insert(
                CameraId::new(config.id.clone()),
                CameraFeed { latest, stop, worker: Some(worker) },
            );
        }

        Ok(Self { feeds })
    }

    pub fn shutdown(&mut self) {
        for feed in self.feeds.values() {
            feed.stop.store(true, Ordering::SeqCst);
        }
        for (id, feed) in self.feeds.iter_mut() {
            if let Some(worker) = feed.worker.take() {
                if worker.join().is_err() {
                    tracing::warn!("Capture thread for camera {} panicked", id);
                }
            }
        }
    }
}

impl Drop for V4l2FrameSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FrameSource for V4l2FrameSource {
    fn current_frame(&self, camera: &CameraId) -> Result<FramePoll> {
        let feed = self.feeds
            .get(camera)
            .ok_or_else(|| KioskError::UnknownCamera(camera.to_string()))?;

        let raw = match feed.latest.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        Ok(match raw.and_then(|raw| decode(&raw).map(|image| (raw.captured_at, image))) {
            Some((captured_at, image)) => FramePoll::Ready(Frame {
                camera: camera.clone(),
                captured_at,
                image: Arc::new(image),
            }),
            None => FramePoll::Pending,
        })
    }
}

fn capture_worker(config: CameraConfig, latest: Arc<Mutex<Option<RawFrame>>>, stop: Arc<AtomicBool>) {
    let (mut device, format) = match open_device(&config) {
        Ok(opened) => opened,
        Err(e) => {
            tracing::error!("Camera {} unavailable: {}", config.id, e);
            return;
        }
    };

    let mut stream = match v4l::io::mmap::Stream::with_buffers(&mut device, Type::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("Failed to create stream for camera {}: {}", config.id, e);
            return;
        }
    };

    tracing::info!("Camera {} streaming {}x{} {}",
        config.id, format.width, format.height, String::from_utf8_lossy(&format.fourcc.repr));

    let mut skipped = 0;
    while !stop.load(Ordering::SeqCst) {
        match stream.next() {
            Ok((buf, meta)) => {
                // IR emitters and auto-exposure need a few frames to settle
                if skipped < config.warmup_frames {
                    skipped += 1;
                    continue;
                }

                let used = match meta.bytesused as usize {
                    0 => buf.len(),
                    n => n.min(buf.len()),
                };
                let raw = RawFrame {
                    data: buf[..used].to_vec(),
                    fourcc: format.fourcc.repr,
                    width: format.width,
                    height: format.height,
                    captured_at: Utc::now(),
                };

                match latest.lock() {
                    Ok(mut slot) => *slot = Some(raw),
                    Err(poisoned) => *poisoned.into_inner() = Some(raw),
                }
            }
            Err(e) => {
                tracing::warn!("Camera {} capture failed: {}", config.id, e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    tracing::debug!("Camera {} capture thread stopped", config.id);
}

fn open_device(config: &CameraConfig) -> Result<(Device, v4l::Format)> {
    let device = Device::new(config.device_index as usize)
        .map_err(|e| KioskError::Camera(format!("Failed to open /dev/video{}: {}", config.device_index, e)))?;

    let caps = device.query_caps()
        .map_err(|e| KioskError::Camera(format!("Failed to query capabilities: {}", e)))?;

    // Some IR devices report only metadata capability but still stream
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        tracing::warn!("Device {} ({}) may not support standard video capture", config.device_index, caps.card);
    }

    let mut fmt = device.format()
        .map_err(|e| KioskError::Camera(format!("Failed to get format: {}", e)))?;

    fmt.width = config.width;
    fmt.height = config.height;

    // Keep GREY for IR sensors, otherwise ask for MJPG
    if fmt.fourcc.repr != *b"GREY" {
        fmt.fourcc = FourCC::new(b"MJPG");
    }

    if let Err(e) = device.set_format(&fmt) {
        tracing::warn!("Could not set exact format on camera {}: {}. Using device defaults.", config.id, e);
    }

    let actual = device.format()
        .map_err(|e| KioskError::Camera(format!("Failed to get final format: {}", e)))?;

    if actual.width != config.width || actual.height != config.height {
        tracing::warn!("Camera {} resolution {}x{} differs from requested {}x{}",
            config.id, actual.width, actual.height, config.width, config.height);
    }

    Ok((device, actual))
}

fn decode(raw: &RawFrame) -> Option<DynamicImage> {
    let pixels = (raw.width as usize) * (raw.height as usize);

    match &raw.fourcc {
        b"GREY" => {
            if raw.data.len() < pixels {
                return None;
            }
            GrayImage::from_raw(raw.width, raw.height, raw.data[..pixels].to_vec())
                .map(DynamicImage::ImageLuma8)
        }
        b"YUYV" => {
            if raw.data.len() < pixels * 2 {
                return None;
            }
            // Y0 U Y1 V: every other byte is luma
            let luma: Vec<u8> = raw.data.iter().step_by(2).take(pixels).copied().collect();
            GrayImage::from_raw(raw.width, raw.height, luma).map(DynamicImage::ImageLuma8)
        }
        b"MJPG" => image::load_from_memory_with_format(&raw.data, image::ImageFormat::Jpeg).ok(),
        _ => None,
    }
}

/// List all V4L2 devices with their capture formats
pub fn list_all_cameras() -> Result<Vec<CameraInfo>> {
    let mut cameras = Vec::new();

    for entry in fs::read_dir("/dev")? {
        let entry = entry?;
        let path = entry.path();
        let Some(index) = path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("video"))
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let Ok(device) = Device::new(index as usize) else { continue };
        let Ok(caps) = device.query_caps() else { continue };

        let formats = device.enum_formats()
            .unwrap_or_default()
            .iter()
            .map(|fmt| String::from_utf8_lossy(&fmt.fourcc.repr).trim().to_string())
            .collect();

        cameras.push(CameraInfo {
            index,
            name: caps.card.clone(),
            formats,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
        });
    }

    cameras.sort_by_key(|c| c.index);
    Ok(cameras)
}
