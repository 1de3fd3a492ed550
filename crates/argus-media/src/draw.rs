//! Draw overlay: bbox outlines with an optional label/score legend.

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use argus_formats::native::BBox;
use argus_formats::PredictionPayload;

const OUTLINE: Rgb<u8> = Rgb([0, 0, 255]);
const LEGEND_BG: Rgb<u8> = Rgb([255, 0, 0]);
const LEGEND_FG: Rgb<u8> = Rgb([255, 255, 255]);
const LEGEND_SCALE: f32 = 14.0;

/// Common system locations for a usable sans-serif TTF.
const FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
];

fn load_system_font() -> Option<FontVec> {
    for path in FONT_PATHS {
        if let Ok(data) = std::fs::read(path) {
            if let Ok(font) = FontVec::try_from_vec(data) {
                tracing::debug!(path, "loaded legend font");
                return Some(font);
            }
        }
    }
    None
}

/// Scale a normalized bbox to pixel coordinates, clamped to the image.
/// Returns `(x, y, width, height)`; degenerate boxes yield `None`.
pub(crate) fn bbox_to_pixels(bbox: &BBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let w = f64::from(width);
    let h = f64::from(height);
    let xmin = (bbox.xmin.clamp(0.0, 1.0) * w) as u32;
    let ymin = (bbox.ymin.clamp(0.0, 1.0) * h) as u32;
    let xmax = ((bbox.xmax.clamp(0.0, 1.0) * w) as u32).min(width);
    let ymax = ((bbox.ymax.clamp(0.0, 1.0) * h) as u32).min(height);
    if xmax <= xmin || ymax <= ymin {
        return None;
    }
    Some((xmin, ymin, xmax - xmin, ymax - ymin))
}

/// Outlines each predicted region and optionally writes a legend into a
/// contrasting box at the region's bottom-left corner.
pub struct DrawOverlay {
    draw_labels: bool,
    draw_scores: bool,
    font: Option<FontVec>,
}

impl DrawOverlay {
    pub fn new(draw_labels: bool, draw_scores: bool) -> Self {
        let font = if draw_labels || draw_scores {
            let font = load_system_font();
            if font.is_none() {
                tracing::warn!("no system font found, legends will be boxes only");
            }
            font
        } else {
            None
        };
        Self {
            draw_labels,
            draw_scores,
            font,
        }
    }

    fn legend(&self, label: &str, score: Option<f64>) -> String {
        let mut text = String::new();
        if self.draw_labels {
            text.push_str(label);
        }
        if let Some(score) = score.filter(|_| self.draw_scores) {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("{score:.4}"));
        }
        text
    }

    pub fn apply(&self, image: &RgbImage, predictions: Option<&PredictionPayload>) -> RgbImage {
        let mut canvas = image.clone();
        let Some(predictions) = predictions else {
            return canvas;
        };
        let (width, height) = canvas.dimensions();

        for region in predictions.regions() {
            let Some(bbox) = region.bbox else { continue };
            let Some((x, y, w, h)) = bbox_to_pixels(&bbox, width, height) else {
                continue;
            };
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(x as i32, y as i32).of_size(w, h),
                OUTLINE,
            );

            let text = self.legend(&region.label, region.score);
            if text.is_empty() {
                continue;
            }
            let scale = PxScale::from(LEGEND_SCALE);
            if let Some(font) = &self.font {
                let (text_w, text_h) = text_size(scale, font, &text);
                let text_w = (text_w as u32).max(1);
                let text_h = (text_h as u32).max(1);
                let legend_y = (y + h).saturating_sub(text_h);
                draw_filled_rect_mut(
                    &mut canvas,
                    Rect::at(x as i32, legend_y as i32).of_size(text_w, text_h),
                    LEGEND_BG,
                );
                draw_text_mut(
                    &mut canvas,
                    LEGEND_FG,
                    x as i32,
                    legend_y as i32,
                    scale,
                    font,
                    &text,
                );
            } else {
                // No font available: still mark the legend position.
                let text_h = LEGEND_SCALE as u32;
                let legend_y = (y + h).saturating_sub(text_h);
                draw_filled_rect_mut(
                    &mut canvas,
                    Rect::at(x as i32, legend_y as i32).of_size(w.min(40), text_h),
                    LEGEND_BG,
                );
            }
        }
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_formats::native::{
        Annotation, BBox, Labels, Output, PredictionRecord, Roi,
    };

    fn record_with_box() -> PredictionPayload {
        PredictionPayload::Native(PredictionRecord {
            outputs: vec![Output {
                labels: Labels {
                    predicted: vec![Annotation {
                        label_id: None,
                        label_name: "face".into(),
                        score: 0.9,
                        threshold: None,
                        roi: Some(Roi {
                            bbox: BBox {
                                xmin: 0.25,
                                ymin: 0.25,
                                xmax: 0.75,
                                ymax: 0.75,
                            },
                        }),
                    }],
                    ..Default::default()
                },
            }],
        })
    }

    #[test]
    fn bbox_scaling_clamps_and_rejects_degenerate() {
        let bbox = BBox {
            xmin: -0.5,
            ymin: 0.0,
            xmax: 1.5,
            ymax: 1.0,
        };
        assert_eq!(bbox_to_pixels(&bbox, 100, 50), Some((0, 0, 100, 50)));

        let empty = BBox {
            xmin: 0.5,
            ymin: 0.5,
            xmax: 0.5,
            ymax: 0.9,
        };
        assert_eq!(bbox_to_pixels(&empty, 100, 50), None);
    }

    #[test]
    fn outline_changes_pixels_on_the_box_edge() {
        let overlay = DrawOverlay::new(false, false);
        let image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let out = overlay.apply(&image, Some(&record_with_box()));
        assert_eq!(*out.get_pixel(25, 25), OUTLINE);
        // Center is untouched.
        assert_eq!(*out.get_pixel(50, 50), Rgb([0, 0, 0]));
    }

    #[test]
    fn without_predictions_image_is_unchanged() {
        let overlay = DrawOverlay::new(true, true);
        let image = RgbImage::from_pixel(10, 10, Rgb([7, 7, 7]));
        let out = overlay.apply(&image, None);
        assert_eq!(out, image);
    }

    #[test]
    fn legend_text_combines_label_and_score() {
        let overlay = DrawOverlay {
            draw_labels: true,
            draw_scores: true,
            font: None,
        };
        assert_eq!(overlay.legend("cat", Some(0.5)), "cat 0.5000");

        let labels_only = DrawOverlay {
            draw_labels: true,
            draw_scores: false,
            font: None,
        };
        assert_eq!(labels_only.legend("cat", Some(0.5)), "cat");
    }
}
