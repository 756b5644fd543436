use crate::common::{AttendanceError, Result, config::AnnotationConfig};
use crate::core::detector::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};
use serde::Serialize;

static BUNDLED_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// How a recognized face relates to today's ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sighting {
    /// Confirmed and first written to the ledger by this cycle.
    New,
    /// Already present in the ledger.
    Known,
    /// Shown but not confident enough to be recorded.
    Tentative,
}

impl Sighting {
    fn color(self) -> Rgb<u8> {
        match self {
            Sighting::New => Rgb([255, 255, 255]),
            Sighting::Known => Rgb([0, 255, 0]),
            Sighting::Tentative => Rgb([255, 200, 0]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionResult {
    pub name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub status: Sighting,
}

/// Draws boxes with a `name (confidence)` label above each.
pub struct Annotator {
    font: Font<'static>,
    scale: Scale,
}

impl Annotator {
    /// Uses `font_path` when set, the bundled DejaVu Sans otherwise.
    pub fn from_config(config: &AnnotationConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => {
                let bytes = std::fs::read(path)?;
                Font::try_from_vec(bytes).ok_or_else(|| {
                    AttendanceError::Other(anyhow::anyhow!("Invalid font file {}", path.display()))
                })?
            }
            None => bundled_font()?,
        };
        Ok(Self { font, scale: Scale::uniform(config.font_scale) })
    }

    pub fn bundled(font_scale: f32) -> Result<Self> {
        Ok(Self { font: bundled_font()?, scale: Scale::uniform(font_scale) })
    }

    pub fn draw(&self, canvas: &mut RgbImage, results: &[RecognitionResult]) {
        for result in results {
            let color = result.status.color();
            let bbox = result.bbox;
            if bbox.width == 0 || bbox.height == 0 {
                continue;
            }

            let rect = Rect::at(bbox.x as i32, bbox.y as i32).of_size(bbox.width, bbox.height);
            draw_hollow_rect_mut(canvas, rect, color);
            // Second pass for a 2px border
            if bbox.width > 2 && bbox.height > 2 {
                let inner = Rect::at(bbox.x as i32 + 1, bbox.y as i32 + 1)
                    .of_size(bbox.width - 2, bbox.height - 2);
                draw_hollow_rect_mut(canvas, inner, color);
            }

            let text = format!("{} ({:.2})", result.name, result.confidence);
            let (text_width, _) = text_size(self.scale, &self.font, &text);
            let text_height = self.scale.y.ceil() as u32 + 4;
            let text_y = (bbox.y as i32 - text_height as i32).max(0);
            let backdrop_width = bbox.width.max(text_width.max(0) as u32 + 4);
            let backdrop = Rect::at(bbox.x as i32, text_y).of_size(backdrop_width, text_height);
            draw_filled_rect_mut(canvas, backdrop, Rgb([0, 0, 0]));
            draw_text_mut(canvas, color, bbox.x as i32 + 2, text_y + 2, self.scale, &self.font, &text);
        }
    }
}

fn bundled_font() -> Result<Font<'static>> {
    Font::try_from_bytes(BUNDLED_FONT)
        .ok_or_else(|| AttendanceError::Other(anyhow::anyhow!("Bundled font is corrupt")))
}
