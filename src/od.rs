pub const OBJ_NUMB_MAX_SIZE: usize = 128;
pub const NMS_THRESH: f32 = 0.45;
pub const BOX_THRESH: f32 = 0.25;
pub const HELMET_IOU_THRESH: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ImageRect {
    pub fn from_xyxy(f_box: [f32; 4]) -> Self {
        Self {
            left: f_box[0] as i32,
            top: f_box[1] as i32,
            right: f_box[2] as i32,
            bottom: f_box[3] as i32,
        }
    }

    pub fn xyxy(&self) -> [f32; 4] {
        [
            self.left as f32,
            self.top as f32,
            self.right as f32,
            self.bottom as f32,
        ]
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() as f32 * self.height() as f32
    }

    /// Intersection over union. The epsilon keeps degenerate boxes from
    /// dividing by zero.
    pub fn iou(&self, other: &Self) -> f32 {
        let x_a = self.left.max(other.left);
        let y_a = self.top.max(other.top);
        let x_b = self.right.min(other.right);
        let y_b = self.bottom.min(other.bottom);

        let inter = (x_b - x_a).max(0) as f32 * (y_b - y_a).max(0) as f32;
        inter / (self.area() + other.area() - inter + 1e-6)
    }
}

#[derive(Debug, Clone)]
pub struct ObjectDetection {
    pub rect: ImageRect,
    pub prop: f32,
    pub cls_id: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectDetectList {
    results: Vec<ObjectDetection>,
}

impl ObjectDetectList {
    pub fn new(results: Vec<ObjectDetection>) -> Self {
        Self { results }
    }

    pub fn count(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get_results(&self) -> Vec<(i32, f32, [f32; 4])> {
        self.results
            .iter()
            .map(|d| (d.cls_id, d.prop, d.rect.xyxy()))
            .collect()
    }
}

/// Greedy NMS: keep the highest-confidence box of each cluster, drop
/// same-class boxes overlapping a kept one by `thresh` or more.
pub fn non_max_suppression(
    mut dets: Vec<ObjectDetection>,
    thresh: f32,
) -> Vec<ObjectDetection> {
    dets.sort_by(|a, b| {
        b.prop
            .partial_cmp(&a.prop)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<ObjectDetection> = Vec::new();
    'candidates: for det in dets {
        for kept in &keep {
            if kept.cls_id == det.cls_id && kept.rect.iou(&det.rect) >= thresh {
                continue 'candidates;
            }
        }
        keep.push(det);
    }
    keep
}

#[derive(Debug, Clone)]
pub struct RiderVerdict {
    pub rect: ImageRect,
    pub prop: f32,
    pub helmeted: bool,
}

/// Splits labeled results into helmet boxes and rider boxes, then marks a
/// rider helmeted when any helmet box overlaps it past `HELMET_IOU_THRESH`.
pub fn associate_riders(results: &[(String, f32, [f32; 4])]) -> Vec<RiderVerdict> {
    let mut helmets: Vec<ImageRect> = Vec::new();
    let mut riders: Vec<(ImageRect, f32)> = Vec::new();

    for (label, prop, f_box) in results {
        if label == "helmet" {
            helmets.push(ImageRect::from_xyxy(*f_box));
        } else {
            riders.push((ImageRect::from_xyxy(*f_box), *prop));
        }
    }

    riders
        .into_iter()
        .map(|(rect, prop)| {
            let helmeted = helmets.iter().any(|h| rect.iou(h) > HELMET_IOU_THRESH);
            RiderVerdict {
                rect,
                prop,
                helmeted,
            }
        })
        .collect()
}

/// The rider detections left unhelmeted by [`associate_riders`], with
/// the labels and boxes they were detected with. This is what gets
/// reported upstream.
pub fn unhelmeted_riders(results: &[(String, f32, [f32; 4])]) -> Vec<(String, f32, [f32; 4])> {
    let verdicts = associate_riders(results);
    results
        .iter()
        .filter(|(label, _, _)| label != "helmet")
        .zip(&verdicts)
        .filter(|(_, v)| !v.helmeted)
        .map(|(r, _)| r.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(left: i32, top: i32, right: i32, bottom: i32) -> ImageRect {
        ImageRect {
            left,
            top,
            right,
            bottom,
        }
    }

    fn det(r: ImageRect, prop: f32, cls_id: i32) -> ObjectDetection {
        ObjectDetection {
            rect: r,
            prop,
            cls_id,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = rect(10, 10, 50, 50);
        assert!((a.iou(&a) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = rect(0, 0, 10, 10);
        let b = rect(20, 20, 30, 30);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        // inter 50, union 150
        let a = rect(0, 0, 10, 10);
        let b = rect(5, 0, 15, 10);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn iou_of_degenerate_boxes_is_finite() {
        let a = rect(5, 5, 5, 5);
        let b = rect(5, 5, 5, 5);
        let v = a.iou(&b);
        assert!(v.is_finite());
        assert_eq!(v, 0.0);
    }

    #[test]
    fn nms_keeps_strongest_of_overlapping_pair() {
        let dets = vec![
            det(rect(0, 0, 100, 100), 0.6, 3),
            det(rect(5, 5, 105, 105), 0.9, 3),
        ];
        let kept = non_max_suppression(dets, NMS_THRESH);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].prop - 0.9).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_overlapping_boxes_of_different_classes() {
        let dets = vec![
            det(rect(0, 0, 100, 100), 0.6, 3),
            det(rect(5, 5, 105, 105), 0.9, 4),
        ];
        let kept = non_max_suppression(dets, NMS_THRESH);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn nms_keeps_separated_boxes() {
        let dets = vec![
            det(rect(0, 0, 50, 50), 0.6, 3),
            det(rect(200, 200, 250, 250), 0.9, 3),
        ];
        let kept = non_max_suppression(dets, NMS_THRESH);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn rider_with_overlapping_helmet_is_helmeted() {
        let results = vec![
            ("motorcycle".to_string(), 0.8, [0.0, 0.0, 100.0, 100.0]),
            ("helmet".to_string(), 0.9, [0.0, 0.0, 20.0, 60.0]),
        ];
        let verdicts = associate_riders(&results);
        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].helmeted);
    }

    #[test]
    fn rider_without_helmet_overlap_is_unhelmeted() {
        let results = vec![
            ("motorcycle".to_string(), 0.8, [0.0, 0.0, 100.0, 100.0]),
            ("helmet".to_string(), 0.9, [300.0, 300.0, 320.0, 360.0]),
        ];
        let verdicts = associate_riders(&results);
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].helmeted);
    }

    #[test]
    fn association_threshold_is_strict() {
        // inter 1000 over union 10000 sits at the 0.1 boundary and must
        // not count; 1200 over 10000 must.
        let at_boundary = vec![
            ("motorcycle".to_string(), 0.8, [0.0, 0.0, 100.0, 100.0]),
            ("helmet".to_string(), 0.9, [0.0, 0.0, 20.0, 50.0]),
        ];
        assert!(!associate_riders(&at_boundary)[0].helmeted);

        let above = vec![
            ("motorcycle".to_string(), 0.8, [0.0, 0.0, 100.0, 100.0]),
            ("helmet".to_string(), 0.9, [0.0, 0.0, 20.0, 60.0]),
        ];
        assert!(associate_riders(&above)[0].helmeted);
    }

    #[test]
    fn no_helmet_label_counts_as_rider() {
        let results = vec![("no_helmet".to_string(), 0.7, [0.0, 0.0, 50.0, 50.0])];
        let verdicts = associate_riders(&results);
        assert_eq!(verdicts.len(), 1);
        assert!(!verdicts[0].helmeted);
    }

    #[test]
    fn unhelmeted_riders_keeps_only_violations() {
        let results = vec![
            ("motorcycle".to_string(), 0.8, [0.0, 0.0, 100.0, 100.0]),
            ("helmet".to_string(), 0.9, [0.0, 0.0, 20.0, 60.0]),
            ("motorcycle".to_string(), 0.7, [300.0, 300.0, 400.0, 400.0]),
        ];
        let violations = unhelmeted_riders(&results);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].0, "motorcycle");
        assert_eq!(violations[0].2, [300.0, 300.0, 400.0, 400.0]);
    }
}
