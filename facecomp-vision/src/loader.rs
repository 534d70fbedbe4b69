use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::Path;

use image::{GrayImage, ImageFormat, ImageReader, RgbImage};

use crate::error::VisionError;
use crate::region::Region;

/// Decoded upload in canonical RGB8. Never mutated after loading.
#[derive(Debug, Clone)]
pub struct Image {
    rgb: RgbImage,
}

impl Image {
    pub fn from_rgb(rgb: RgbImage) -> Result<Self, VisionError> {
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(VisionError::Decode("image has no pixels".to_string()));
        }
        Ok(Self { rgb })
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// 8-bit luma view, used by the cascade detector and the patch extractor.
    pub fn gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.rgb)
    }

    /// Owned copy of the pixels inside `region`.
    pub fn crop(&self, region: &Region) -> RgbImage {
        image::imageops::crop_imm(&self.rgb, region.x, region.y, region.width, region.height)
            .to_image()
    }
}

/// Decode an image starting at the reader's current position.
///
/// The format is sniffed from the content. The reader is left wherever the
/// decoder stopped; callers that need the bytes again must seek back themselves.
pub fn load_image<R: BufRead + Seek>(reader: R) -> Result<Image, VisionError> {
    let decoded = ImageReader::new(reader)
        .with_guessed_format()
        .map_err(|e| VisionError::Decode(e.to_string()))?
        .decode()?;
    log::debug!(
        "decoded image {}x{} ({:?})",
        decoded.width(),
        decoded.height(),
        decoded.color()
    );
    Image::from_rgb(decoded.to_rgb8())
}

pub fn load_image_path(path: &Path) -> Result<Image, VisionError> {
    let file = File::open(path)
        .map_err(|e| VisionError::Decode(format!("{}: {}", path.display(), e)))?;
    load_image(BufReader::new(file))
}

/// MIME type of an encoded image, `image/jpeg` when it cannot be sniffed.
pub fn guess_media_type(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("image/jpeg")
}

/// Formats multimodal model APIs accept as image attachments.
pub const ATTACHABLE_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::WebP,
];

/// The upload itself when its format is in [`ATTACHABLE_FORMATS`], otherwise
/// the decoded pixels re-encoded as PNG.
pub fn attachable_bytes(raw: &[u8]) -> Result<Cow<'_, [u8]>, VisionError> {
    if let Ok(format) = image::guess_format(raw) {
        if ATTACHABLE_FORMATS.contains(&format) {
            return Ok(Cow::Borrowed(raw));
        }
    }
    let image = load_image(Cursor::new(raw))?;
    let mut out = Cursor::new(Vec::new());
    image.rgb().write_to(&mut out, ImageFormat::Png)?;
    log::debug!("re-encoded {} byte upload as {} byte png", raw.len(), out.get_ref().len());
    Ok(Cow::Owned(out.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::{Cursor, Read, SeekFrom};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_load_png() {
        let img = load_image(Cursor::new(png_bytes(32, 16))).unwrap();
        assert_eq!((img.width(), img.height()), (32, 16));
        assert_eq!(img.rgb().get_pixel(3, 5), &Rgb([3, 5, 128]));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = load_image(Cursor::new(b"definitely not an image".to_vec())).unwrap_err();
        assert!(matches!(err, VisionError::Decode(_)));
    }

    #[test]
    fn test_reads_from_current_position() {
        let mut data = b"JUNKJUNK".to_vec();
        data.extend(png_bytes(8, 8));
        let mut cursor = Cursor::new(data);
        cursor.seek(SeekFrom::Start(8)).unwrap();
        let img = load_image(&mut cursor).unwrap();
        assert_eq!(img.width(), 8);

        // No implicit rewind: rereading requires an explicit seek.
        cursor.rewind().unwrap();
        let mut prefix = [0u8; 4];
        cursor.read_exact(&mut prefix).unwrap();
        assert_eq!(&prefix, b"JUNK");
    }

    #[test]
    fn test_media_type() {
        assert_eq!(guess_media_type(&png_bytes(2, 2)), "image/png");
        assert_eq!(guess_media_type(b"????"), "image/jpeg");
    }

    #[test]
    fn test_bmp_is_reencoded_as_png() {
        let img = RgbImage::from_fn(6, 4, |x, y| Rgb([x as u8 * 40, y as u8 * 60, 9]));
        let mut bmp = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut bmp, ImageFormat::Bmp)
            .unwrap();
        let bmp = bmp.into_inner();
        assert_eq!(guess_media_type(&bmp), "image/bmp");

        let attached = attachable_bytes(&bmp).unwrap();
        assert_eq!(guess_media_type(&attached), "image/png");
        let back = load_image(Cursor::new(attached.into_owned())).unwrap();
        assert_eq!(back.rgb(), &img);
    }

    #[test]
    fn test_png_is_attached_unchanged() {
        let png = png_bytes(5, 5);
        assert!(matches!(attachable_bytes(&png).unwrap(), Cow::Borrowed(b) if b == png.as_slice()));
    }

    #[test]
    fn test_crop_and_gray() {
        let img = load_image(Cursor::new(png_bytes(20, 20))).unwrap();
        let region = Region::new(5, 6, 4, 3);
        let crop = img.crop(&region);
        assert_eq!(crop.dimensions(), (4, 3));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([5, 6, 128]));
        assert_eq!(img.gray().dimensions(), (20, 20));
    }
}
