use image::{GrayImage, RgbImage};
use std::sync::Arc;
use std::time::SystemTime;

/// A single captured video frame in RGB24, shared read-only between consumers
#[derive(Debug, Clone)]
pub struct Frame {
    /// Timestamp when the frame was captured
    pub timestamp: SystemTime,
    /// Raw RGB24 data (shared ownership, never mutated after capture)
    pub data: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    pub fn new(timestamp: SystemTime, data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            timestamp,
            data: Arc::new(data),
            width,
            height,
        }
    }

    /// Expected byte length for the frame dimensions
    pub fn expected_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Validate frame data size against the dimensions
    pub fn validate_size(&self) -> bool {
        self.data.len() == self.expected_size()
    }

    /// Decode into an owned RGB image for drawing
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.as_ref().clone())
    }

    /// Convert to grayscale using the standard luma weights
    pub fn to_gray(&self) -> GrayImage {
        let mut gray = GrayImage::new(self.width, self.height);
        for (i, pixel) in gray.pixels_mut().enumerate() {
            let base = i * 3;
            if base + 2 < self.data.len() {
                let r = self.data[base] as f32;
                let g = self.data[base + 1] as f32;
                let b = self.data[base + 2] as f32;
                pixel.0 = [(0.299 * r + 0.587 * g + 0.114 * b) as u8];
            }
        }
        gray
    }

    /// Rebuild a frame from an annotated image, keeping the original timestamp
    pub fn from_rgb_image(timestamp: SystemTime, image: RgbImage) -> Self {
        let width = image.width();
        let height = image.height();
        Self {
            timestamp,
            data: Arc::new(image.into_raw()),
            width,
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_validation() {
        let frame = Frame::new(SystemTime::now(), vec![0u8; 320 * 240 * 3], 320, 240);
        assert!(frame.validate_size());

        let bad = Frame::new(SystemTime::now(), vec![0u8; 100], 320, 240);
        assert!(!bad.validate_size());
    }

    #[test]
    fn test_grayscale_conversion() {
        // uniform mid-gray frame converts to uniform mid-gray mask
        let frame = Frame::new(SystemTime::now(), vec![128u8; 4 * 4 * 3], 4, 4);
        let gray = frame.to_gray();
        assert_eq!(gray.dimensions(), (4, 4));
        assert!(gray.pixels().all(|p| (p.0[0] as i16 - 128).abs() <= 1));
    }

    #[test]
    fn test_rgb_image_roundtrip() {
        let frame = Frame::new(SystemTime::now(), vec![7u8; 8 * 6 * 3], 8, 6);
        let image = frame.to_rgb_image().unwrap();
        let rebuilt = Frame::from_rgb_image(frame.timestamp, image);
        assert_eq!(rebuilt.width, 8);
        assert_eq!(rebuilt.height, 6);
        assert_eq!(rebuilt.data.as_ref(), frame.data.as_ref());
    }
}
