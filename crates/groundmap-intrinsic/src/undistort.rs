//! Frame undistortion by inverse remapping.

use std::borrow::Cow;

use groundmap_core::{Frame, FrameError};
use nalgebra::Point2;

use crate::camera::CameraModel;

fn sample_channel(frame: &Frame, x: f64, y: f64, c: usize) -> f64 {
    // no neighbour of a point this far out is inside the frame
    if !(x > -1.0 && y > -1.0 && x < frame.width as f64 && y < frame.height as f64) {
        return 0.0;
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let (x0, y0) = (x0 as i64, y0 as i64);
    let (w, h, ch) = (frame.width as i64, frame.height as i64, frame.channels);

    let px = |xi: i64, yi: i64| -> f64 {
        if xi < 0 || yi < 0 || xi >= w || yi >= h {
            return 0.0;
        }
        frame.data[(yi as usize * frame.width + xi as usize) * ch + c] as f64
    };

    let a = px(x0, y0) + fx * (px(x0 + 1, y0) - px(x0, y0));
    let b = px(x0, y0 + 1) + fx * (px(x0 + 1, y0 + 1) - px(x0, y0 + 1));
    a + fy * (b - a)
}

/// Remap `frame` so it looks as if taken by the distortion-free pinhole `camera.k`.
///
/// Pixels whose source falls outside the frame are black.
pub fn undistort_frame(frame: &Frame, camera: &CameraModel) -> Result<Frame, FrameError> {
    frame.validate()?;
    let (w, h, ch) = (frame.width, frame.height, frame.channels);
    let mut data = vec![0u8; frame.data.len()];

    for v in 0..h {
        for u in 0..w {
            let n = camera.pixel_to_normalized(Point2::new(u as f64, v as f64));
            let src = camera.normalized_to_pixel(camera.distort(n));
            if !src.x.is_finite() || !src.y.is_finite() {
                continue;
            }
            let base = (v * w + u) * ch;
            for c in 0..ch {
                data[base + c] = sample_channel(frame, src.x, src.y, c).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    Ok(Frame {
        width: w,
        height: h,
        channels: ch,
        data,
    })
}

/// Fail-open undistortion: without a usable model, or on an invalid frame, the
/// input comes back unchanged.
pub fn undistort_or_passthrough<'a>(frame: &'a Frame, camera: Option<&CameraModel>) -> Cow<'a, Frame> {
    let Some(camera) = camera else {
        return Cow::Borrowed(frame);
    };
    if let Err(e) = camera.validate() {
        log::warn!("undistort skipped, invalid camera model: {e}");
        return Cow::Borrowed(frame);
    }
    match undistort_frame(frame, camera) {
        Ok(out) => Cow::Owned(out),
        Err(e) => {
            log::warn!("undistort skipped: {e}");
            Cow::Borrowed(frame)
        }
    }
}
