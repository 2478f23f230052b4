#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8], // row-major, len = w*h
}

#[derive(Clone, Debug, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> u8) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[inline]
fn get_gray(src: &GrayImageView<'_>, x: i32, y: i32) -> u8 {
    if x < 0 || y < 0 || x >= src.width as i32 || y >= src.height as i32 {
        return 0;
    }
    src.data[y as usize * src.width + x as usize]
}

/// Bilinear sample with zero padding outside the image.
#[inline]
pub fn sample_bilinear(src: &GrayImageView<'_>, x: f32, y: f32) -> f32 {
    if !(x > -1.0 && y > -1.0 && x < src.width as f32 && y < src.height as f32) {
        return 0.0;
    }
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_gray(src, x0, y0) as f32;
    let p10 = get_gray(src, x0 + 1, y0) as f32;
    let p01 = get_gray(src, x0, y0 + 1) as f32;
    let p11 = get_gray(src, x0 + 1, y0 + 1) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

#[inline]
pub fn sample_bilinear_u8(src: &GrayImageView<'_>, x: f32, y: f32) -> u8 {
    sample_bilinear(src, x, y).clamp(0.0, 255.0) as u8
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("unsupported pixel format: {0} channels")]
    UnsupportedChannels(usize),
    #[error("buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

/// Interleaved 8-bit frame as delivered by a capture source.
///
/// One channel is grayscale, three are BGR, four are BGRA.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap a buffer, checking that its length matches the geometry.
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let expected = width * height * channels;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn from_gray(img: GrayImage) -> Self {
        Self {
            width: img.width,
            height: img.height,
            channels: 1,
            data: img.data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Check emptiness, channel layout and buffer length.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.is_empty() {
            return Err(FrameError::Empty);
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(FrameError::UnsupportedChannels(self.channels));
        }
        let expected = self.width * self.height * self.channels;
        if self.data.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Luma conversion (BT.601 weights on BGR order).
    pub fn to_gray(&self) -> Result<GrayImage, FrameError> {
        self.validate()?;
        let data = match self.channels {
            1 => self.data.clone(),
            c => self
                .data
                .chunks_exact(c)
                .map(|px| {
                    let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                    ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
                })
                .collect(),
        };
        Ok(GrayImage {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_interpolates_between_pixels() {
        let img = GrayImage::from_fn(2, 1, |x, _| if x == 0 { 0 } else { 100 });
        let v = sample_bilinear(&img.view(), 0.25, 0.0);
        assert!((v - 25.0).abs() < 1e-4);
        assert_eq!(sample_bilinear_u8(&img.view(), -5.0, -5.0), 0);
    }

    #[test]
    fn far_and_non_finite_coordinates_sample_zero() {
        let img = GrayImage::from_fn(4, 4, |_, _| 200);
        let view = img.view();
        assert_eq!(sample_bilinear(&view, 3.0e9, 1.0), 0.0);
        assert_eq!(sample_bilinear(&view, 1.0, -3.0e9), 0.0);
        assert_eq!(sample_bilinear(&view, f32::NAN, 1.0), 0.0);
        assert_eq!(sample_bilinear(&view, f32::INFINITY, f32::INFINITY), 0.0);
        assert!(sample_bilinear(&view, -0.5, 1.0) > 0.0);
    }

    #[test]
    fn bgr_frame_converts_to_luma() {
        let frame = Frame::new(2, 1, 3, vec![255, 255, 255, 0, 0, 255]).unwrap();
        let gray = frame.to_gray().unwrap();
        assert_eq!(gray.data, vec![255, 76]);
    }

    #[test]
    fn invalid_frames_are_rejected() {
        assert_eq!(
            Frame::new(2, 2, 1, vec![0; 3]).unwrap_err(),
            FrameError::BufferSize {
                expected: 4,
                actual: 3
            }
        );
        let two_channel = Frame {
            width: 1,
            height: 1,
            channels: 2,
            data: vec![0, 0],
        };
        assert_eq!(
            two_channel.to_gray().unwrap_err(),
            FrameError::UnsupportedChannels(2)
        );
        let empty = Frame {
            width: 0,
            height: 0,
            channels: 1,
            data: vec![],
        };
        assert_eq!(empty.validate().unwrap_err(), FrameError::Empty);
    }
}
