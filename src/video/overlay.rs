use chrono::{DateTime, Local};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use std::time::SystemTime;
use tracing::warn;

const TEXT_ORIGIN: (i32, i32) = (20, 20);
const FONT_SIZE: f32 = 16.0;

/// Draws the timestamp/name banner and motion rectangles onto frames.
///
/// A missing or unreadable font disables the text overlay but never fails the
/// worker; recording continues without annotation.
pub struct OverlayRenderer {
    font: Option<Font<'static>>,
    scale: Scale,
}

impl OverlayRenderer {
    pub fn from_path(font_path: &str) -> Self {
        let font = match std::fs::read(font_path) {
            Ok(data) => match Font::try_from_vec(data) {
                Some(font) => Some(font),
                None => {
                    warn!("Failed to parse overlay font '{}'", font_path);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read overlay font '{}': {}", font_path, e);
                None
            }
        };
        Self {
            font,
            scale: Scale::uniform(FONT_SIZE),
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self {
            font: None,
            scale: Scale::uniform(FONT_SIZE),
        }
    }

    /// Banner text for a frame: `YYYY/MM/DD HH:MM:SS - name`
    pub fn banner_text(timestamp: SystemTime, name: &str) -> String {
        let local: DateTime<Local> = timestamp.into();
        let stamp = local.format("%Y/%m/%d %H:%M:%S");
        if name.is_empty() {
            stamp.to_string()
        } else {
            format!("{} - {}", stamp, name)
        }
    }

    /// Draw the banner at the top-left: black understroke below a white stroke
    pub fn stamp(&self, image: &mut RgbImage, timestamp: SystemTime, name: &str) {
        let Some(font) = &self.font else {
            return;
        };
        let text = Self::banner_text(timestamp, name);
        let (x, y) = TEXT_ORIGIN;

        for dx in -2i32..=2 {
            for dy in -2i32..=2 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                draw_text_mut(
                    image,
                    Rgb([0, 0, 0]),
                    x + dx,
                    y + dy,
                    self.scale,
                    font,
                    &text,
                );
            }
        }
        draw_text_mut(image, Rgb([255, 255, 255]), x, y, self.scale, font, &text);
    }
}

/// Draw a red rectangle of 2px thickness around a detected motion area
pub fn draw_motion_rectangle(image: &mut RgbImage, min: (u32, u32), max: (u32, u32)) {
    let red = Rgb([255, 0, 0]);
    let width = (max.0.saturating_sub(min.0)).max(1);
    let height = (max.1.saturating_sub(min.1)).max(1);

    let outer = Rect::at(min.0 as i32, min.1 as i32).of_size(width, height);
    imageproc::drawing::draw_hollow_rect_mut(image, outer, red);
    if width > 2 && height > 2 {
        let inner = Rect::at(min.0 as i32 + 1, min.1 as i32 + 1).of_size(width - 2, height - 2);
        imageproc::drawing::draw_hollow_rect_mut(image, inner, red);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_banner_text_format() {
        // 2026-08-01 00:00:00 UTC; rendered in local time, so only check shape
        let timestamp = UNIX_EPOCH + Duration::from_secs(1_785_542_400);
        let text = OverlayRenderer::banner_text(timestamp, "front door");
        assert!(text.ends_with(" - front door"));
        let stamp = text.split(" - ").next().unwrap();
        assert_eq!(stamp.len(), "2026/08/01 00:00:00".len());
        assert_eq!(&stamp[4..5], "/");
        assert_eq!(&stamp[13..14], ":");

        let unnamed = OverlayRenderer::banner_text(timestamp, "");
        assert!(!unnamed.contains(" - "));
    }

    #[test]
    fn test_disabled_overlay_is_noop() {
        let renderer = OverlayRenderer::disabled();
        let mut image = RgbImage::from_pixel(64, 48, Rgb([128, 128, 128]));
        let before = image.clone();
        renderer.stamp(&mut image, SystemTime::now(), "cam");
        assert_eq!(image, before);
    }

    #[test]
    fn test_motion_rectangle_draws_red() {
        let mut image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        draw_motion_rectangle(&mut image, (4, 4), (20, 20));
        assert_eq!(*image.get_pixel(4, 4), Rgb([255, 0, 0]));
        assert_eq!(*image.get_pixel(20, 4), Rgb([255, 0, 0]));
        // interior untouched
        assert_eq!(*image.get_pixel(10, 10), Rgb([0, 0, 0]));
    }
}
