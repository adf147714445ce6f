use image::{DynamicImage, Rgb};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use crate::common::{KioskError, Result};
use crate::core::matcher::{Classification, MatchResult};
use crate::core::types::{Detection, FaceBox, Frame};

/// Writes annotated query frames next to the ledger so a reviewer can see
/// what each detection event was decided on.
pub struct SnapshotWriter {
    dir: PathBuf,
}

impl SnapshotWriter {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Saves the frame as PNG with the face box drawn on it and returns the
    /// path to store as the event's snapshot reference.
    pub async fn save(&self, frame: &Frame, detection: &Detection, result: &MatchResult) -> Result<String> {
        let file_name = format!(
            "{}_{}_{}.png",
            sanitize(frame.camera.as_str()),
            frame.captured_at.format("%Y%m%dT%H%M%S%3f"),
            result.classification.as_str().to_ascii_lowercase()
        );
        let path = self.dir.join(file_name);

        let image = frame.image.clone();
        let face = detection.face_box;
        let confidence = detection.confidence;
        let classification = result.classification;
        let target = path.clone();

        tokio::task::spawn_blocking(move || {
            annotate(&image, &face, confidence, classification).save(&target)
        })
        .await
        .map_err(|e| KioskError::Other(anyhow::anyhow!("Snapshot task failed: {}", e)))??;

        tracing::debug!("Saved snapshot {}", path.display());
        Ok(path.to_string_lossy().into_owned())
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn color_for(classification: Classification) -> Rgb<u8> {
    match classification {
        Classification::Matched => Rgb([0, 255, 0]),
        Classification::MultipleMatches => Rgb([255, 255, 0]),
        Classification::NewFace => Rgb([0, 255, 255]),
        Classification::Unknown => Rgb([255, 0, 0]),
    }
}

/// Draws the face box in the classification's color with a confidence bar
/// along its bottom edge.
pub fn annotate(image: &DynamicImage, face: &FaceBox, confidence: f32, classification: Classification) -> DynamicImage {
    let mut img = image.to_rgb8();
    let color = color_for(classification);

    if face.width() <= 0.0 || face.height() <= 0.0 {
        return DynamicImage::ImageRgb8(img);
    }

    let x1 = face.x1.max(0.0) as i32;
    let y1 = face.y1.max(0.0) as i32;
    let x2 = face.x2.min(img.width() as f32) as i32;
    let y2 = face.y2.min(img.height() as f32) as i32;

    let rect_width = (x2 - x1).max(1) as u32;
    let rect_height = (y2 - y1).max(1) as u32;

    draw_hollow_rect_mut(&mut img, Rect::at(x1, y1).of_size(rect_width, rect_height), color);
    if rect_width > 2 && rect_height > 2 {
        draw_hollow_rect_mut(&mut img, Rect::at(x1 + 1, y1 + 1).of_size(rect_width - 2, rect_height - 2), color);
    }

    let bar_width = ((rect_width as f32) * confidence.clamp(0.0, 1.0)).round() as u32;
    let bar_y = y2 + 2;
    if bar_width > 0 && bar_y + 3 < img.height() as i32 {
        draw_filled_rect_mut(&mut img, Rect::at(x1, bar_y).of_size(bar_width, 3), color);
    }

    DynamicImage::ImageRgb8(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn draws_box_in_classification_color() {
        let image = DynamicImage::ImageLuma8(GrayImage::new(40, 40));
        let face = FaceBox { x1: 5.0, y1: 5.0, x2: 25.0, y2: 25.0 };

        let annotated = annotate(&image, &face, 0.5, Classification::Matched).to_rgb8();

        assert_eq!(annotated.get_pixel(5, 5), &Rgb([0, 255, 0]));
        assert_eq!(annotated.get_pixel(15, 15), &Rgb([0, 0, 0]));
        // confidence bar covers half the box width
        assert_eq!(annotated.get_pixel(6, 28), &Rgb([0, 255, 0]));
        assert_eq!(annotated.get_pixel(20, 28), &Rgb([0, 0, 0]));
    }

    #[test]
    fn degenerate_box_leaves_image_untouched() {
        let image = DynamicImage::ImageLuma8(GrayImage::new(10, 10));
        let face = FaceBox { x1: 5.0, y1: 5.0, x2: 5.0, y2: 9.0 };
        let annotated = annotate(&image, &face, 0.9, Classification::Unknown).to_rgb8();
        assert!(annotated.pixels().all(|p| p == &Rgb([0, 0, 0])));
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize("front door/2"), "front_door_2");
    }
}
