use serde::{Deserialize, Serialize};

/// Image container detected from magic bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Tiff,
    Heic,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
            Self::Heic => "image/heic",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Heic => "heic",
        }
    }
}

/// Detect image format from magic bytes (NOT the declared MIME type).
/// A data URI claiming `image/png` around JPEG bytes is still a JPEG.
pub fn detect_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    match bytes {
        // JPEG: starts with FF D8 FF
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
        // PNG: starts with 89 50 4E 47
        [0x89, 0x50, 0x4E, 0x47, ..] => Some(ImageFormat::Png),
        [b'G', b'I', b'F', b'8', ..] => Some(ImageFormat::Gif),
        // WebP: RIFF....WEBP
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::Webp),
        // BMP: "BM", file size, two zero reserved words, pixel offset (14-byte header)
        [b'B', b'M', _, _, _, _, 0, 0, 0, 0, _, _, _, _, ..] => Some(ImageFormat::Bmp),
        // TIFF: little-endian (49 49 2A 00) or big-endian (4D 4D 00 2A)
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some(ImageFormat::Tiff),
        // HEIC/HEIF: "ftyp" at offset 4
        _ if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" => Some(ImageFormat::Heic),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_jpeg() {
        let bytes = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
        assert_eq!(detect_image_format(&bytes), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
    }

    #[test]
    fn detects_png() {
        let bytes = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(detect_image_format(&bytes), Some(ImageFormat::Png));
    }

    #[test]
    fn detects_webp() {
        let bytes = *b"RIFF\x24\x00\x00\x00WEBPVP8 ";
        assert_eq!(detect_image_format(&bytes), Some(ImageFormat::Webp));
    }

    #[test]
    fn detects_tiff_both_endians() {
        assert_eq!(detect_image_format(&[0x49, 0x49, 0x2A, 0x00]), Some(ImageFormat::Tiff));
        assert_eq!(detect_image_format(&[0x4D, 0x4D, 0x00, 0x2A]), Some(ImageFormat::Tiff));
    }

    #[test]
    fn detects_heic() {
        let bytes = *b"\x00\x00\x00\x18ftypheic";
        assert_eq!(detect_image_format(&bytes), Some(ImageFormat::Heic));
    }

    #[test]
    fn detects_bmp_only_with_full_header() {
        let header = [b'B', b'M', 0x46, 0, 0, 0, 0, 0, 0, 0, 0x36, 0, 0, 0, 0x28, 0];
        assert_eq!(detect_image_format(&header), Some(ImageFormat::Bmp));
        assert_eq!(detect_image_format(b"BMW plate 12A3456 spotted"), None);
        assert_eq!(detect_image_format(b"BM"), None);
    }

    #[test]
    fn rejects_text_and_pdf() {
        assert_eq!(detect_image_format(b"hello world, not an image"), None);
        assert_eq!(detect_image_format(b"%PDF-1.7\n"), None);
        assert_eq!(detect_image_format(&[]), None);
    }
}
