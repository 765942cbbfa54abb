use std::path::Path;

use image::error::ImageError;
use image::ImageReader;

pub const IMAGE_EXTENSION: &str = "jpg";
pub const UPSCALED_EXTENSION: &str = "png";
pub const DATA_EXTENSION: &str = "txt";

/// Zero-padded index so bulk upscalers sort frame lists correctly.
pub fn lexicon_value(width: usize, index: usize) -> String {
    format!("{:0width$}", index, width = width)
}

/// Decodes the whole image; the format is sniffed from content, not the extension.
pub fn verify(path: &Path) -> Result<(), ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicon_value_pads_to_width() {
        assert_eq!(lexicon_value(6, 1), "000001");
        assert_eq!(lexicon_value(6, 240), "000240");
        assert_eq!(lexicon_value(6, 1234567), "1234567");
    }

    #[test]
    fn truncated_image_does_not_verify() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        image::RgbImage::new(4, 4).save(&good).unwrap();
        verify(&good).unwrap();

        let bytes = std::fs::read(&good).unwrap();
        let truncated = dir.path().join("output_000001.jpg");
        std::fs::write(&truncated, &bytes[..20]).unwrap();
        assert!(verify(&truncated).is_err());
    }
}
