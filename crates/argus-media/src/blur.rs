//! Blur overlay: obscures each predicted region.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use argus_formats::PredictionPayload;

use crate::draw::bbox_to_pixels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurMethod {
    /// Downscale-upscale mosaic with nearest-neighbor interpolation.
    Pixel,
    Gaussian,
    Black,
}

impl std::str::FromStr for BlurMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pixel" => Ok(Self::Pixel),
            "gaussian" => Ok(Self::Gaussian),
            "black" => Ok(Self::Black),
            other => Err(format!(
                "unknown blur method '{other}' (expected pixel, gaussian or black)"
            )),
        }
    }
}

pub const DEFAULT_BLUR_STRENGTH: u32 = 10;

pub struct BlurOverlay {
    method: BlurMethod,
    strength: u32,
}

impl BlurOverlay {
    pub fn new(method: BlurMethod, strength: u32) -> Self {
        Self {
            method,
            strength: strength.max(1),
        }
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
            match self.method {
                BlurMethod::Black => {
                    draw_filled_rect_mut(
                        &mut canvas,
                        Rect::at(x as i32, y as i32).of_size(w, h),
                        Rgb([0, 0, 0]),
                    );
                }
                BlurMethod::Gaussian => {
                    let patch = imageops::crop_imm(&canvas, x, y, w, h).to_image();
                    let blurred = imageops::blur(&patch, self.strength as f32);
                    imageops::replace(&mut canvas, &blurred, i64::from(x), i64::from(y));
                }
                BlurMethod::Pixel => {
                    // The downscale factor is bounded by the region size so a
                    // small box never collapses below one pixel.
                    let patch = imageops::crop_imm(&canvas, x, y, w, h).to_image();
                    let down_w = (w / w.min(self.strength)).max(1);
                    let down_h = (h / h.min(self.strength)).max(1);
                    let small = imageops::resize(&patch, down_w, down_h, FilterType::Triangle);
                    let mosaic = imageops::resize(&small, w, h, FilterType::Nearest);
                    imageops::replace(&mut canvas, &mosaic, i64::from(x), i64::from(y));
                }
            }
        }
        canvas
    }
}
