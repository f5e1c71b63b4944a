use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::{Error, ErrorKind, Result};

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::Deserialize;

use crate::od::ImageRect;

const FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
const LABEL_SCALE: f32 = 20.0;
const STOP_LINE_THICKNESS: i32 = 2;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);

/// Fixed colors for the safety-hat classes, a stable hash color for
/// anything else the model may emit.
pub fn class_color(label: &str) -> Rgb<u8> {
    match label {
        "helmet" => GREEN,
        "no_helmet" => RED,
        _ => {
            let mut hasher = DefaultHasher::new();
            label.hash(&mut hasher);
            let h = (hasher.finish() % 255) as u32;
            Rgb([
                ((h * 3) % 255) as u8,
                ((h * 7) % 255) as u8,
                ((h * 11) % 255) as u8,
            ])
        }
    }
}

/// Scales a box toward its own center by `factor`, clamped to the frame.
pub fn shrink_box(f_box: [f32; 4], factor: f32, width: u32, height: u32) -> ImageRect {
    let cx = (f_box[0] + f_box[2]) / 2.0;
    let cy = (f_box[1] + f_box[3]) / 2.0;
    let half_w = (f_box[2] - f_box[0]) * factor / 2.0;
    let half_h = (f_box[3] - f_box[1]) * factor / 2.0;

    let max_x = width.saturating_sub(1) as i32;
    let max_y = height.saturating_sub(1) as i32;
    ImageRect {
        left: ((cx - half_w) as i32).clamp(0, max_x),
        top: ((cy - half_h) as i32).clamp(0, max_y),
        right: ((cx + half_w) as i32).clamp(0, max_x),
        bottom: ((cy + half_h) as i32).clamp(0, max_y),
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LightCycle {
    pub green: u64,
    pub yellow: u64,
    pub red: u64,
}

impl Default for LightCycle {
    fn default() -> Self {
        Self {
            green: 90,
            yellow: 5,
            red: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightPhase {
    Green,
    Yellow,
    Red,
}

impl LightPhase {
    /// Phase for a wall-clock offset, wrapping over the full cycle.
    pub fn at(elapsed_secs: u64, cycle: &LightCycle) -> Self {
        let total = cycle.green + cycle.yellow + cycle.red;
        if total == 0 {
            return Self::Green;
        }
        let e = elapsed_secs % total;
        if e < cycle.green {
            Self::Green
        } else if e < cycle.green + cycle.yellow {
            Self::Yellow
        } else {
            Self::Red
        }
    }

    pub fn color(&self) -> Rgb<u8> {
        match self {
            Self::Green => GREEN,
            Self::Yellow => YELLOW,
            Self::Red => RED,
        }
    }

    pub fn caption(&self) -> &'static str {
        match self {
            Self::Green => "Hijau - GO",
            Self::Yellow => "Kuning - SIAP",
            Self::Red => "Merah - BERHENTI",
        }
    }
}

/// Maps stop-zone vertices from their reference frame onto the render
/// size, truncating to whole pixels.
pub fn scale_zone(
    points: &[[f32; 2]],
    ref_size: [f32; 2],
    width: u32,
    height: u32,
) -> Vec<(f32, f32)> {
    points
        .iter()
        .map(|p| {
            (
                (p[0] * width as f32 / ref_size[0]).floor(),
                (p[1] * height as f32 / ref_size[1]).floor(),
            )
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnnotationStyle {
    /// Helmet boxes green, everything else red, plain labels.
    Monitor,
    /// Per-class colors, heavier border on `no_helmet`, uppercased labels.
    Publish,
}

pub struct Annotator {
    font: FontArc,
    style: AnnotationStyle,
    box_scale: f32,
}

impl Annotator {
    pub fn new(style: AnnotationStyle, box_scale: f32) -> Result<Self> {
        let font = FontArc::try_from_slice(FONT_DATA)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
        Ok(Self {
            font,
            style,
            box_scale,
        })
    }

    pub fn draw_detections(&self, img: &mut RgbImage, results: &[(String, f32, [f32; 4])]) {
        let (width, height) = img.dimensions();
        for (label, prop, f_box) in results {
            let rect = shrink_box(*f_box, self.box_scale, width, height);
            if rect.width() <= 0 || rect.height() <= 0 {
                continue;
            }

            let (color, thickness) = match self.style {
                AnnotationStyle::Monitor => {
                    (if label == "helmet" { GREEN } else { RED }, 2)
                }
                AnnotationStyle::Publish => (
                    class_color(label),
                    if label == "no_helmet" { 3 } else { 2 },
                ),
            };
            draw_rect(img, &rect, color, thickness);

            let text = match self.style {
                AnnotationStyle::Monitor => format!("{label} {prop:.2}"),
                AnnotationStyle::Publish => {
                    format!("{} {prop:.2}", label.to_uppercase())
                }
            };
            let ty = match self.style {
                AnnotationStyle::Monitor => rect.top.max(0),
                AnnotationStyle::Publish => (rect.top - 8).max(15),
            };
            draw_text_mut(
                img,
                color,
                rect.left.max(0),
                ty,
                PxScale::from(LABEL_SCALE),
                &self.font,
                &text,
            );
        }
    }

    /// Closed stop-zone polyline in the light color, captioned above the
    /// first vertex.
    pub fn draw_stop_zone(&self, img: &mut RgbImage, zone: &[(f32, f32)], phase: LightPhase) {
        if zone.len() < 2 {
            return;
        }
        let color = phase.color();
        for i in 0..zone.len() {
            let a = zone[i];
            let b = zone[(i + 1) % zone.len()];
            for t in 0..STOP_LINE_THICKNESS {
                let dy = t as f32;
                draw_line_segment_mut(img, (a.0, a.1 + dy), (b.0, b.1 + dy), color);
            }
        }
        draw_text_mut(
            img,
            color,
            zone[0].0 as i32,
            (zone[0].1 as i32 - 10).max(0),
            PxScale::from(LABEL_SCALE),
            &self.font,
            phase.caption(),
        );
    }
}

fn draw_rect(img: &mut RgbImage, rect: &ImageRect, color: Rgb<u8>, thickness: i32) {
    for t in 0..thickness {
        let w = rect.width() - 2 * t;
        let h = rect.height() - 2 * t;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            img,
            Rect::at(rect.left + t, rect.top + t).of_size(w as u32, h as u32),
            color,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_scales_toward_center() {
        let r = shrink_box([0.0, 0.0, 100.0, 100.0], 0.84, 426, 240);
        assert_eq!(
            r,
            ImageRect {
                left: 8,
                top: 8,
                right: 92,
                bottom: 92
            }
        );
    }

    #[test]
    fn shrink_clamps_to_frame() {
        let r = shrink_box([-50.0, -50.0, 1000.0, 1000.0], 1.0, 426, 240);
        assert_eq!(r.left, 0);
        assert_eq!(r.top, 0);
        assert_eq!(r.right, 425);
        assert_eq!(r.bottom, 239);
    }

    #[test]
    fn helmet_classes_have_fixed_colors() {
        assert_eq!(class_color("helmet"), GREEN);
        assert_eq!(class_color("no_helmet"), RED);
    }

    #[test]
    fn hash_colors_are_deterministic() {
        assert_eq!(class_color("car"), class_color("car"));
        assert_ne!(class_color("car"), class_color("truck"));
    }

    #[test]
    fn light_phase_boundaries() {
        let cycle = LightCycle::default();
        assert_eq!(LightPhase::at(0, &cycle), LightPhase::Green);
        assert_eq!(LightPhase::at(89, &cycle), LightPhase::Green);
        assert_eq!(LightPhase::at(90, &cycle), LightPhase::Yellow);
        assert_eq!(LightPhase::at(94, &cycle), LightPhase::Yellow);
        assert_eq!(LightPhase::at(95, &cycle), LightPhase::Red);
        assert_eq!(LightPhase::at(154, &cycle), LightPhase::Red);
        // Wraps back around.
        assert_eq!(LightPhase::at(155, &cycle), LightPhase::Green);
        assert_eq!(LightPhase::at(310, &cycle), LightPhase::Green);
    }

    #[test]
    fn zero_cycle_defaults_to_green() {
        let cycle = LightCycle {
            green: 0,
            yellow: 0,
            red: 0,
        };
        assert_eq!(LightPhase::at(42, &cycle), LightPhase::Green);
    }

    #[test]
    fn zone_scales_from_reference_frame() {
        let points = [[200.0, 210.0], [590.0, 320.0]];
        let scaled = scale_zone(&points, [960.0, 520.0], 426, 240);
        assert_eq!(scaled[0], (88.0, 96.0));
        assert_eq!(scaled[1], (261.0, 147.0));
    }

    #[test]
    fn annotator_draws_on_small_frames_without_panicking() {
        let annotator = Annotator::new(AnnotationStyle::Publish, 0.84).unwrap();
        let mut img = RgbImage::new(32, 32);
        let results = vec![
            ("no_helmet".to_string(), 0.9, [2.0, 2.0, 30.0, 30.0]),
            ("helmet".to_string(), 0.8, [-10.0, -10.0, 100.0, 100.0]),
        ];
        annotator.draw_detections(&mut img, &results);
        annotator.draw_stop_zone(
            &mut img,
            &[(1.0, 1.0), (30.0, 1.0), (30.0, 30.0)],
            LightPhase::Red,
        );
    }
}
