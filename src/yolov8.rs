use std::io::{Error, ErrorKind, Result};

use image::{ImageReader, Rgb, RgbImage, imageops};
use ort::session::{Session, builder::GraphOptimizationLevel};
use tracing::{error, info};

use crate::od::{
    BOX_THRESH, ImageRect, NMS_THRESH, OBJ_NUMB_MAX_SIZE, ObjectDetectList, ObjectDetection,
    non_max_suppression,
};

/// The safety-hat model is exported with a fixed 640x640 input
/// (`yolo export format=onnx imgsz=640`).
pub const MODEL_SIZE: u32 = 640;

const LETTERBOX_FILL: u8 = 114;

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

pub struct OnnxAppContext {
    session: Option<Session>,
    model_width: u32,
    model_height: u32,
    model_channel: u32,
}

impl OnnxAppContext {
    pub fn new() -> Self {
        Self {
            session: None,
            model_width: 0,
            model_height: 0,
            model_channel: 0,
        }
    }

    pub fn init_model(&mut self, path: &str) -> Result<()> {
        info!("Loading model: {path}");
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| {
                error!("Failed to init onnx session: {e}");
                Error::new(ErrorKind::InvalidInput, "Failed to init onnx session")
            })?;

        info!(
            "Model input num: {}, output num: {}",
            session.inputs.len(),
            session.outputs.len()
        );
        let input_names = session
            .inputs
            .iter()
            .map(|i| i.name.as_str())
            .collect::<Vec<_>>();
        let output_names = session
            .outputs
            .iter()
            .map(|o| o.name.as_str())
            .collect::<Vec<_>>();
        info!("Model inputs: {input_names:?}, outputs: {output_names:?}");

        self.session = Some(session);
        self.model_width = MODEL_SIZE;
        self.model_height = MODEL_SIZE;
        self.model_channel = 3;
        info!(
            "model input height={}, width={}, channel={}",
            self.model_height, self.model_width, self.model_channel
        );
        Ok(())
    }

    /// Runs the model over one RGB24 frame. Boxes in the returned list are
    /// clamped to frame coordinates.
    pub fn inference_model(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<ObjectDetectList> {
        let session = self.session.as_mut().ok_or_else(|| {
            error!("Model has not been initialized");
            Error::new(ErrorKind::NotFound, "Model has not been initialized")
        })?;

        let (input, lb) = letterbox(rgb, width, height, self.model_width)?;
        let shape = [
            1usize,
            self.model_channel as usize,
            self.model_height as usize,
            self.model_width as usize,
        ];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice())).map_err(
                |e| {
                    error!("Failed to build input tensor: {e}");
                    Error::new(ErrorKind::InvalidData, "Failed to build input tensor")
                },
            )?;

        let outputs = session.run(ort::inputs![input_value]).map_err(|e| {
            error!("Failed to run onnx session: {e}");
            Error::new(ErrorKind::Interrupted, "Failed to run onnx session")
        })?;

        let output = outputs
            .get("output0")
            .or_else(|| outputs.get("output"))
            .ok_or_else(|| {
                error!("Model output node missing");
                Error::new(ErrorKind::InvalidData, "Model output node missing")
            })?;
        let (out_shape, data) = output.try_extract_tensor::<f32>().map_err(|e| {
            error!("Failed to extract model output: {e}");
            Error::new(ErrorKind::InvalidData, "Failed to extract model output")
        })?;

        // Expect [1, 4 + classes, anchors]
        if out_shape.len() != 3 {
            error!("Unexpected output shape: {out_shape:?}");
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Unexpected model output shape",
            ));
        }
        let attrs = out_shape[1] as usize;
        let anchors = out_shape[2] as usize;
        if attrs < 5 || data.len() < attrs * anchors {
            error!("Output tensor too small: attrs={attrs}, anchors={anchors}");
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Output tensor too small",
            ));
        }

        Ok(decode_output(data, attrs, anchors, &lb, width, height))
    }

    /// Convenience for single-image runs: decode a file, then infer.
    pub fn inference_image(&mut self, img_path: &str) -> Result<ObjectDetectList> {
        let reader = ImageReader::open(img_path)?;
        let img = match reader.decode() {
            Ok(m) => m,
            Err(e) => {
                return Err(Error::new(ErrorKind::InvalidInput, e.to_string()));
            }
        };
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        self.inference_model(rgb.as_raw(), width, height)
    }
}

/// Scales the frame to fit `size` keeping aspect ratio, pads the rest with
/// gray, and converts HWC u8 to normalized CHW f32.
fn letterbox(rgb: &[u8], width: u32, height: u32, size: u32) -> Result<(Vec<f32>, Letterbox)> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected || width == 0 || height == 0 {
        error!("Bad frame buffer: {} bytes for {width}x{height}", rgb.len());
        return Err(Error::new(ErrorKind::InvalidInput, "Bad frame buffer"));
    }
    let img = RgbImage::from_raw(width, height, rgb.to_vec())
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "Bad frame buffer"))?;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let scaled_w = ((width as f32 * scale) as u32).max(1);
    let scaled_h = ((height as f32 * scale) as u32).max(1);
    let pad_x = (size - scaled_w) as f32 / 2.0;
    let pad_y = (size - scaled_h) as f32 / 2.0;

    let resized = imageops::resize(&img, scaled_w, scaled_h, imageops::FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let side = size as usize;
    let data = canvas.as_raw();
    let mut input = vec![0f32; 3 * side * side];
    for c in 0..3 {
        for y in 0..side {
            for x in 0..side {
                let hwc = (y * side + x) * 3 + c;
                let chw = c * side * side + y * side + x;
                input[chw] = data[hwc] as f32 / 255.0;
            }
        }
    }

    Ok((
        input,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    ))
}

/// Decodes a `[1, 4 + classes, anchors]` output plane: best class per
/// anchor, confidence filter, letterbox reversal, clamp, NMS.
fn decode_output(
    output: &[f32],
    attrs: usize,
    anchors: usize,
    lb: &Letterbox,
    frame_w: u32,
    frame_h: u32,
) -> ObjectDetectList {
    let classes = attrs - 4;
    let mut dets: Vec<ObjectDetection> = Vec::new();

    for i in 0..anchors {
        let cx = output[i];
        let cy = output[anchors + i];
        let w = output[2 * anchors + i];
        let h = output[3 * anchors + i];

        let mut best = 0usize;
        let mut max_conf = 0f32;
        for c in 0..classes {
            let conf = output[(4 + c) * anchors + i];
            if conf > max_conf {
                max_conf = conf;
                best = c;
            }
        }
        if max_conf < BOX_THRESH {
            continue;
        }

        let x1 = ((cx - w / 2.0 - lb.pad_x) / lb.scale).clamp(0.0, frame_w as f32);
        let y1 = ((cy - h / 2.0 - lb.pad_y) / lb.scale).clamp(0.0, frame_h as f32);
        let x2 = ((cx + w / 2.0 - lb.pad_x) / lb.scale).clamp(0.0, frame_w as f32);
        let y2 = ((cy + h / 2.0 - lb.pad_y) / lb.scale).clamp(0.0, frame_h as f32);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        dets.push(ObjectDetection {
            rect: ImageRect::from_xyxy([x1, y1, x2, y2]),
            prop: max_conf,
            cls_id: best as i32,
        });
    }

    let mut keep = non_max_suppression(dets, NMS_THRESH);
    keep.truncate(OBJ_NUMB_MAX_SIZE);
    ObjectDetectList::new(keep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_landscape_pads_vertically() {
        let (w, h) = (640u32, 360u32);
        let rgb = vec![0u8; (w * h * 3) as usize];
        let (input, lb) = letterbox(&rgb, w, h, MODEL_SIZE).unwrap();
        assert_eq!(input.len(), 3 * 640 * 640);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
    }

    #[test]
    fn letterbox_fills_padding_with_gray() {
        let (w, h) = (640u32, 360u32);
        let rgb = vec![200u8; (w * h * 3) as usize];
        let (input, _) = letterbox(&rgb, w, h, MODEL_SIZE).unwrap();
        // Top-left pixel of channel 0 sits inside the vertical padding.
        assert!((input[0] - LETTERBOX_FILL as f32 / 255.0).abs() < 1e-6);
        // Center pixel comes from the image.
        let center = 320usize * 640 + 320;
        assert!((input[center] - 200.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn letterbox_rejects_short_buffer() {
        let rgb = vec![0u8; 10];
        assert!(letterbox(&rgb, 640, 360, MODEL_SIZE).is_err());
    }

    // Builds a [1, 4 + classes, anchors] plane with one confident anchor.
    fn synthetic_output(
        attrs: usize,
        anchors: usize,
        at: usize,
        cls: usize,
        conf: f32,
        cxywh: [f32; 4],
    ) -> Vec<f32> {
        let mut out = vec![0f32; attrs * anchors];
        out[at] = cxywh[0];
        out[anchors + at] = cxywh[1];
        out[2 * anchors + at] = cxywh[2];
        out[3 * anchors + at] = cxywh[3];
        out[(4 + cls) * anchors + at] = conf;
        out
    }

    #[test]
    fn decode_finds_confident_box() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let out = synthetic_output(6, 100, 7, 1, 0.9, [100.0, 100.0, 40.0, 60.0]);
        let list = decode_output(&out, 6, 100, &lb, 640, 640);
        let results = list.get_results();
        assert_eq!(results.len(), 1);
        let (cls_id, prop, f_box) = results[0];
        assert_eq!(cls_id, 1);
        assert!((prop - 0.9).abs() < 1e-6);
        assert_eq!(f_box, [80.0, 70.0, 120.0, 130.0]);
    }

    #[test]
    fn decode_filters_low_confidence() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let out = synthetic_output(6, 100, 7, 1, 0.2, [100.0, 100.0, 40.0, 60.0]);
        let list = decode_output(&out, 6, 100, &lb, 640, 640);
        assert!(list.is_empty());
    }

    #[test]
    fn decode_reverses_letterbox() {
        // Half-scale with horizontal padding: a box at model (330, 160)
        // maps back to frame (640, 320) offsets.
        let lb = Letterbox {
            scale: 0.5,
            pad_x: 10.0,
            pad_y: 0.0,
        };
        let out = synthetic_output(6, 100, 0, 0, 0.8, [330.0, 160.0, 20.0, 40.0]);
        let list = decode_output(&out, 6, 100, &lb, 1240, 640);
        let (_, _, f_box) = list.get_results()[0];
        assert_eq!(f_box, [620.0, 280.0, 660.0, 360.0]);
    }

    #[test]
    fn decode_clamps_to_frame() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let out = synthetic_output(6, 100, 3, 0, 0.8, [5.0, 5.0, 40.0, 40.0]);
        let list = decode_output(&out, 6, 100, &lb, 640, 640);
        let (_, _, f_box) = list.get_results()[0];
        assert_eq!(f_box[0], 0.0);
        assert_eq!(f_box[1], 0.0);
    }
}
