//! Conversion between `image` buffers and [`Frame`].
//!
//! Frames use OpenCV channel order (BGR / BGRA); `image` uses RGB / RGBA.

use ::image::{DynamicImage, ImageBuffer, Luma, Rgb, Rgba};
use groundmap_core::{Frame, FrameError, GrayImageView};

#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("frame of {width}x{height} does not fit an image buffer")]
    TooLarge { width: usize, height: usize },
}

/// Borrow an `image::GrayImage` as a [`GrayImageView`].
pub fn gray_view(img: &::image::GrayImage) -> GrayImageView<'_> {
    GrayImageView {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.as_raw(),
    }
}

pub fn frame_from_gray(img: &::image::GrayImage) -> Frame {
    Frame {
        width: img.width() as usize,
        height: img.height() as usize,
        channels: 1,
        data: img.as_raw().clone(),
    }
}

fn swap_red_blue(data: &mut [u8], channels: usize) {
    for px in data.chunks_exact_mut(channels) {
        px.swap(0, 2);
    }
}

/// Frame from any decoded image. Gray stays single channel, colour images
/// become BGR, images with alpha become BGRA. Deep images are reduced to 8 bits.
pub fn frame_from_dynamic(img: &DynamicImage) -> Frame {
    let (width, height) = (img.width() as usize, img.height() as usize);
    match img {
        DynamicImage::ImageLuma8(gray) => frame_from_gray(gray),
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLumaA16(_) => frame_from_gray(&img.to_luma8()),
        _ if img.color().has_alpha() => {
            let mut data = img.to_rgba8().into_raw();
            swap_red_blue(&mut data, 4);
            Frame {
                width,
                height,
                channels: 4,
                data,
            }
        }
        _ => {
            let mut data = img.to_rgb8().into_raw();
            swap_red_blue(&mut data, 3);
            Frame {
                width,
                height,
                channels: 3,
                data,
            }
        }
    }
}

pub fn frame_to_dynamic(frame: &Frame) -> Result<DynamicImage, ConvertError> {
    frame.validate()?;
    let too_large = || ConvertError::TooLarge {
        width: frame.width,
        height: frame.height,
    };
    let width = u32::try_from(frame.width).map_err(|_| too_large())?;
    let height = u32::try_from(frame.height).map_err(|_| too_large())?;
    let mut data = frame.data.clone();
    let img = match frame.channels {
        1 => {
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data).map(DynamicImage::ImageLuma8)
        }
        3 => {
            swap_red_blue(&mut data, 3);
            ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data).map(DynamicImage::ImageRgb8)
        }
        _ => {
            swap_red_blue(&mut data, 4);
            ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, data).map(DynamicImage::ImageRgba8)
        }
    };
    img.ok_or_else(too_large)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_frames_are_bgr() {
        let rgb = ::image::RgbImage::from_fn(3, 2, |x, y| Rgb([10 * x as u8, 100 + y as u8, 200]));
        let frame = frame_from_dynamic(&DynamicImage::ImageRgb8(rgb.clone()));
        assert_eq!(frame.channels, 3);
        assert_eq!(&frame.data[3..6], &[200, 100, 10]);

        let back = frame_to_dynamic(&frame).unwrap();
        assert_eq!(back.to_rgb8(), rgb);
    }

    #[test]
    fn gray_and_alpha_layouts() {
        let gray = ::image::GrayImage::from_fn(4, 4, |x, y| Luma([(x + 4 * y) as u8]));
        let frame = frame_from_dynamic(&DynamicImage::ImageLuma8(gray.clone()));
        assert_eq!(frame.channels, 1);
        assert_eq!(gray_view(&gray).data, frame.data.as_slice());

        let rgba = ::image::RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        let frame = frame_from_dynamic(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(frame.channels, 4);
        assert_eq!(&frame.data[..4], &[3, 2, 1, 4]);

        let bad = Frame {
            width: 2,
            height: 2,
            channels: 2,
            data: vec![0; 8],
        };
        assert!(matches!(
            frame_to_dynamic(&bad),
            Err(ConvertError::Frame(FrameError::UnsupportedChannels(2)))
        ));
    }
}
