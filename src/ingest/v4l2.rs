//! Live-camera feed backed by V4L2.
//!
//! Consumes an already-opened, already-powered device node; sensor and
//! IR-cut filter power sequencing happens in an external process before
//! this one starts. The device is asked for GREY frames first and falls
//! back to RGB3 with an in-process luma conversion.

use anyhow::{anyhow, Context, Result};
use image::GrayImage;
use ouroboros::self_referencing;

use super::FeedConfig;
use crate::frame::luma_from_rgb;

pub(crate) struct V4l2Feed {
    device_path: String,
    state: DeviceState,
    width: u32,
    height: u32,
    format: PixelLayout,
    frames_captured: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PixelLayout {
    Grey,
    Rgb3,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Feed {
    pub(crate) fn open(config: &FeedConfig) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.target)
            .with_context(|| format!("open v4l2 device {}", config.target))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.fourcc = v4l::FourCC::new(b"GREY");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "v4l2: failed to set GREY format on {}: {}",
                    config.target,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let layout = match &format.fourcc.repr {
            b"GREY" => PixelLayout::Grey,
            b"RGB3" => PixelLayout::Rgb3,
            other => {
                return Err(anyhow!(
                    "unsupported v4l2 pixel format {:?} on {}",
                    String::from_utf8_lossy(other),
                    config.target
                ))
            }
        };

        if config.fps > 0.0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps.round() as u32);
            if let Err(err) = device.set_params(&params) {
                log::warn!("v4l2: failed to set fps on {}: {}", config.target, err);
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "feed: v4l2 device {} ({}x{}, {:?})",
            config.target,
            format.width,
            format.height,
            layout
        );

        Ok(Self {
            device_path: config.target.clone(),
            state,
            width: format.width,
            height: format.height,
            format: layout,
            frames_captured: 0,
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// A live device has no natural end of stream; every call either
    /// yields a frame or fails, and the feed layer decides how many
    /// consecutive failures to tolerate.
    pub(crate) fn grab(&mut self) -> Result<Option<GrayImage>> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let gray = self.state.with_stream_mut(|stream| {
            let (buf, _meta) = stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            match format {
                PixelLayout::Grey => {
                    let expected = (width * height) as usize;
                    let pixels = buf
                        .get(..expected)
                        .context("v4l2 GREY buffer shorter than one frame")?
                        .to_vec();
                    GrayImage::from_raw(width, height, pixels)
                        .ok_or_else(|| anyhow!("v4l2 GREY frame has inconsistent dimensions"))
                }
                PixelLayout::Rgb3 => {
                    let expected = (width * height * 3) as usize;
                    let rgb = buf
                        .get(..expected)
                        .context("v4l2 RGB3 buffer shorter than one frame")?;
                    luma_from_rgb(rgb, width, height)
                }
            }
        })?;

        self.frames_captured += 1;
        if self.frames_captured % 300 == 0 {
            log::debug!(
                "v4l2: {} frames captured from {}",
                self.frames_captured,
                self.device_path
            );
        }
        Ok(Some(gray))
    }
}
