use crate::error::{IqdbError, Result};
use image::{DynamicImage, ImageFormat};
use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// 上傳大小上限（8 MiB）
pub const MAX_FILE_SIZE: usize = 8_388_608;

/// 不需轉檔即可直接上傳的格式
const ACCEPTED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Gif];

/// 可讀取且可回到開頭的串流
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// 圖片輸入來源
pub enum ImageInput {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Reader(Box<dyn ReadSeek>),
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        ImageInput::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Bytes(bytes)
    }
}

impl From<&[u8]> for ImageInput {
    fn from(bytes: &[u8]) -> Self {
        ImageInput::Bytes(bytes.to_vec())
    }
}

/// 正規化後可直接上傳的圖片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub format: ImageFormat,
}

impl NormalizedImage {
    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 支援輸入的圖片格式名稱
pub fn supported_image_formats() -> Vec<&'static str> {
    vec!["JPEG", "PNG", "GIF", "BMP", "WEBP", "TIFF"]
}

/// 讀取輸入、偵測實際格式，必要時轉成 PNG
pub fn normalize(input: ImageInput) -> Result<NormalizedImage> {
    let bytes = read_input(input)?;
    normalize_bytes(bytes)
}

fn read_input(input: ImageInput) -> Result<Vec<u8>> {
    match input {
        ImageInput::Path(path) => fs::read(&path).map_err(|e| {
            IqdbError::invalid_argument(format!("無法讀取檔案: {}", path.display())).caused_by(e)
        }),
        ImageInput::Bytes(bytes) => Ok(bytes),
        ImageInput::Reader(mut reader) => {
            let mut bytes = Vec::new();
            reader
                .seek(SeekFrom::Start(0))
                .and_then(|_| reader.read_to_end(&mut bytes))
                .map_err(|e| IqdbError::invalid_argument("無法讀取圖片串流").caused_by(e))?;
            Ok(bytes)
        }
    }
}

fn normalize_bytes(bytes: Vec<u8>) -> Result<NormalizedImage> {
    // 只看內容的 magic bytes，不信任副檔名；可直接上傳的格式也要能解碼
    let format = image::guess_format(&bytes)
        .map_err(|e| IqdbError::invalid_format("無法辨識圖片格式").caused_by(e))?;

    let decoded = image::load_from_memory_with_format(&bytes, format)
        .map_err(|e| IqdbError::invalid_format(format!("無法解碼 {:?} 圖片", format)).caused_by(e))?;

    if ACCEPTED_FORMATS.contains(&format) {
        let extension = format.extensions_str().first().copied().unwrap_or("img");
        return Ok(NormalizedImage {
            bytes,
            filename: format!("image.{}", extension),
            format,
        });
    }

    let png = encode_png(into_png_compatible(decoded))?;
    tracing::debug!("已將 {:?} 轉為 PNG ({} → {} bytes)", format, bytes.len(), png.len());

    Ok(NormalizedImage {
        bytes: png,
        filename: "image.png".to_string(),
        format: ImageFormat::Png,
    })
}

/// PNG 不支援浮點色彩，其餘模式保持原樣
fn into_png_compatible(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
        DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => image,
        _ => DynamicImage::ImageRgba8(image.to_rgba8()),
    }
}

fn encode_png(image: DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| IqdbError::invalid_format("PNG 編碼失敗").caused_by(e))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use image::{Rgb, RgbImage};

    fn encode(format: ImageFormat) -> Vec<u8> {
        let img = RgbImage::from_fn(8, 6, |x, y| Rgb([(x * 30) as u8, (y * 40) as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img).write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_jpeg_passes_through_unchanged() {
        let bytes = encode(ImageFormat::Jpeg);
        let normalized = normalize(ImageInput::Bytes(bytes.clone())).unwrap();

        assert_eq!(normalized.bytes, bytes);
        assert_eq!(normalized.format, ImageFormat::Jpeg);
        assert_eq!(normalized.filename, "image.jpg");
        assert_eq!(normalized.mime_type(), "image/jpeg");
    }

    #[test]
    fn test_bmp_is_reencoded_as_png() {
        let bytes = encode(ImageFormat::Bmp);
        let normalized = normalize(bytes.into()).unwrap();

        assert_eq!(normalized.filename, "image.png");
        assert_eq!(normalized.format, ImageFormat::Png);
        assert_eq!(image::guess_format(&normalized.bytes).unwrap(), ImageFormat::Png);

        let decoded = image::load_from_memory(&normalized.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn test_extension_is_not_trusted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("photo.jpg");
        std::fs::write(&path, encode(ImageFormat::Png)).unwrap();

        let normalized = normalize(path.as_path().into()).unwrap();
        assert_eq!(normalized.filename, "image.png");
    }

    #[test]
    fn test_reader_is_rewound() {
        let bytes = encode(ImageFormat::Png);
        let mut cursor = Cursor::new(bytes.clone());
        cursor.seek(SeekFrom::End(0)).unwrap();

        let normalized = normalize(ImageInput::Reader(Box::new(cursor))).unwrap();
        assert_eq!(normalized.bytes, bytes);
        assert_eq!(normalized.filename, "image.png");
    }

    #[test]
    fn test_corrupt_body_behind_valid_header_is_invalid_format() {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.extend_from_slice(b"this is not a jpeg body at all");
        let err = normalize(bytes.into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);

        let mut png = encode(ImageFormat::Png);
        png.truncate(24);
        let err = normalize(png.into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_garbage_is_invalid_format() {
        let err = normalize(b"definitely not an image".as_slice().into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_missing_file_is_invalid_argument() {
        let err = normalize(PathBuf::from("/nonexistent/image.png").into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
