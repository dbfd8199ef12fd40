//! Recorded-video feed backed by FFmpeg.
//!
//! Decodes a local video file and hands out grayscale frames. Decode
//! errors on individual packets surface as errors the feed layer skips
//! and counts; true end of stream drains the decoder and then reports
//! the feed inactive.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::GrayImage;

use super::FeedConfig;

pub(crate) struct FfmpegFileFeed {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
    finished: bool,
    frames_decoded: u64,
}

impl FfmpegFileFeed {
    pub(crate) fn open(config: &FeedConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.target)
            .with_context(|| format!("failed to open video file '{}'", config.target))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("'{}' has no video track", config.target))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::GRAY8,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg grayscale scaler")?;

        log::info!(
            "feed: video file {} ({}x{})",
            config.target,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            path: config.target.clone(),
            input,
            stream_index,
            decoder,
            scaler,
            eof_sent: false,
            finished: false,
            frames_decoded: 0,
        })
    }

    pub(crate) fn dimensions(&self) -> (u32, u32) {
        (self.decoder.width(), self.decoder.height())
    }

    pub(crate) fn grab(&mut self) -> Result<Option<GrayImage>> {
        if self.finished {
            return Ok(None);
        }

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut gray_frame = ffmpeg::frame::Video::empty();

        if !self.eof_sent {
            let mut got = None;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                if self.decoder.receive_frame(&mut decoded).is_ok() {
                    self.scaler
                        .run(&decoded, &mut gray_frame)
                        .context("scale frame to grayscale")?;
                    got = Some(gray_plane_to_image(&gray_frame)?);
                    break;
                }
            }
            if let Some(gray) = got {
                self.frames_decoded += 1;
                return Ok(Some(gray));
            }
            // Packets exhausted; flush delayed frames out of the decoder.
            self.decoder.send_eof().context("flush ffmpeg decoder")?;
            self.eof_sent = true;
        }

        if self.decoder.receive_frame(&mut decoded).is_ok() {
            self.scaler
                .run(&decoded, &mut gray_frame)
                .context("scale frame to grayscale")?;
            self.frames_decoded += 1;
            return Ok(Some(gray_plane_to_image(&gray_frame)?));
        }

        self.finished = true;
        log::info!("feed: {} exhausted after {} frames", self.path, self.frames_decoded);
        Ok(None)
    }
}

fn gray_plane_to_image(frame: &ffmpeg::frame::Video) -> Result<GrayImage> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width as usize;

    let pixels = if stride == row_bytes {
        data.to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("ffmpeg frame row is out of bounds")?,
            );
        }
        pixels
    };

    GrayImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("decoded frame has inconsistent dimensions"))
}
