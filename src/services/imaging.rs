use image::{DynamicImage, ImageFormat, ImageResult, RgbImage, Rgb};
use std::io::Cursor;

/// Decode arbitrary image bytes and normalise them to 8-bit RGB.
///
/// Providers are not guaranteed to accept palette, grayscale or alpha images,
/// so everything is converted before handoff.
pub fn decode_normalized(bytes: &[u8]) -> ImageResult<RgbImage> {
    let image = image::load_from_memory(bytes)?;
    Ok(normalize(image))
}

/// Convert to RGB, compositing any transparency onto a white background.
pub fn normalize(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |channel: u8| -> u8 {
            // channel * a + 255 * (255 - a), rounded, over 255
            ((u16::from(channel) * alpha + 255 * (255 - alpha) + 127) / 255) as u8
        };
        rgb.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }

    rgb
}

/// Encode for providers that want JPEG (data URLs for chat APIs)
pub fn encode_jpeg(image: &RgbImage) -> ImageResult<Vec<u8>> {
    encode(image, ImageFormat::Jpeg)
}

/// Encode losslessly for inference endpoints that take raw image bytes
pub fn encode_png(image: &RgbImage) -> ImageResult<Vec<u8>> {
    encode(image, ImageFormat::Png)
}

fn encode(image: &RgbImage, format: ImageFormat) -> ImageResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format)?;
    Ok(buffer.into_inner())
}
