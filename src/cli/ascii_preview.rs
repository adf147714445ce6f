use crossterm::{cursor, terminal::{self, ClearType}};
use image::DynamicImage;
use std::io::{self, Write};
use crate::core::capture::{OverlayRenderer, TickOutcome};
use crate::core::types::{CameraId, FaceBox};

const ASCII_RAMP: &str = " .·:;+=xX#@";
const DEFAULT_WIDTH: usize = 80;
const DEFAULT_HEIGHT: usize = 30;

/// Terminal preview of one camera: the frame as ASCII art with the
/// detected face boxed and its confidence printed above the box.
pub struct AsciiOverlay {
    width: usize,
    height: usize,
}

impl AsciiOverlay {
    pub fn new(width: Option<usize>, height: Option<usize>) -> Self {
        let (term_width, term_height) = terminal::size()
            .map(|(w, h)| (w as usize, h as usize))
            .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));

        // half resolution keeps redraws cheap
        Self {
            width: width.unwrap_or((term_width / 2).min(DEFAULT_WIDTH / 2)).max(8),
            height: height.unwrap_or((term_height.saturating_sub(5) / 2).min(DEFAULT_HEIGHT / 2)).max(4),
        }
    }

    /// Text for one tick. `None` when there is nothing new to draw.
    pub fn compose(&self, camera: &CameraId, outcome: &TickOutcome) -> Option<String> {
        let (mut grid, status) = match outcome {
            TickOutcome::Pending => return None,
            TickOutcome::Suspended => {
                let mut grid = vec![vec![' '; self.width]; self.height];
                self.overlay_text(&mut grid, "enrollment in progress", self.width / 2, self.height / 2);
                (grid, "enrolling".to_string())
            }
            TickOutcome::NoFace { frame } => (self.image_to_ascii(&frame.image), "no face".to_string()),
            TickOutcome::Detected { frame, detection } => {
                let mut grid = self.image_to_ascii(&frame.image);
                let img_width = frame.image.width() as f32;
                let img_height = frame.image.height() as f32;
                let label = format!("{:.0}%", detection.confidence * 100.0);

                let x1 = ((detection.face_box.x1 / img_width) * self.width as f32) as usize;
                let x2 = ((detection.face_box.x2 / img_width) * self.width as f32) as usize;
                let y1 = ((detection.face_box.y1 / img_height) * self.height as f32) as usize;
                self.overlay_text(&mut grid, &label, (x1 + x2) / 2, y1.saturating_sub(1));
                self.draw_face_box(&mut grid, &detection.face_box, img_width, img_height);

                (grid, format!("face {:.2}", detection.confidence))
            }
        };

        let header = format!("[{}] {}", camera, status);
        self.overlay_text(&mut grid, &header, header.chars().count() / 2, 0);
        Some(self.grid_to_string(&grid))
    }

    fn image_to_ascii(&self, image: &DynamicImage) -> Vec<Vec<char>> {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let gray = image.to_luma8();
        let (img_width, img_height) = gray.dimensions();
        let ramp: Vec<char> = ASCII_RAMP.chars().collect();

        for term_y in 0..self.height {
            for term_x in 0..self.width {
                let img_x = (term_x as f32 / self.width as f32 * img_width as f32) as u32;
                let img_y = (term_y as f32 / self.height as f32 * img_height as f32) as u32;

                if img_x < img_width && img_y < img_height {
                    let brightness = gray.get_pixel(img_x, img_y)[0] as usize;
                    grid[term_y][term_x] = ramp[brightness * (ramp.len() - 1) / 255];
                }
            }
        }

        grid
    }

    fn overlay_text(&self, grid: &mut [Vec<char>], text: &str, center_x: usize, y: usize) {
        if y >= self.height {
            return;
        }

        let start_x = center_x.saturating_sub(text.chars().count() / 2);
        for (i, ch) in text.chars().enumerate() {
            let x = start_x + i;
            if x < self.width {
                grid[y][x] = ch;
            }
        }
    }

    fn draw_face_box(&self, grid: &mut [Vec<char>], face: &FaceBox, img_width: f32, img_height: f32) {
        let scale_x = |v: f32| (((v / img_width) * self.width as f32) as usize).min(self.width - 1);
        let scale_y = |v: f32| (((v / img_height) * self.height as f32) as usize).min(self.height - 1);

        let (x1, x2) = (scale_x(face.x1), scale_x(face.x2));
        let (y1, y2) = (scale_y(face.y1), scale_y(face.y2));
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        for x in (x1 + 1)..x2 {
            grid[y1][x] = '─';
            grid[y2][x] = '─';
        }
        for row in grid.iter_mut().take(y2).skip(y1 + 1) {
            row[x1] = '│';
            row[x2] = '│';
        }

        grid[y1][x1] = '┌';
        grid[y1][x2] = '┐';
        grid[y2][x1] = '└';
        grid[y2][x2] = '┘';
    }

    fn grid_to_string(&self, grid: &[Vec<char>]) -> String {
        grid.iter()
            .map(|row| row.iter().take(self.width).collect::<String>())
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

impl OverlayRenderer for AsciiOverlay {
    fn render(&mut self, camera: &CameraId, outcome: &TickOutcome) {
        let Some(text) = self.compose(camera, outcome) else {
            return;
        };

        let mut stdout = io::stdout();
        let drawn = crossterm::execute!(stdout, cursor::MoveTo(0, 0))
            .and_then(|_| write!(stdout, "{}", text))
            .and_then(|_| stdout.flush());
        if let Err(e) = drawn {
            tracing::debug!("Preview draw failed: {}", e);
        }
    }
}

pub fn clear_screen() -> io::Result<()> {
    crossterm::execute!(
        io::stdout(),
        terminal::Clear(ClearType::All),
        cursor::MoveTo(0, 0)
    )?;
    io::stdout().flush()
}
