//! RetinaFace-style face detection (det_10g): anchor-based outputs at
//! strides 8/16/32, two anchors per cell, decoded as distances from the
//! anchor centre and suppressed with NMS.

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;
use std::cmp::Ordering;
use std::sync::Mutex;

use crate::onnx::build_session;

/// A detected face in original-frame pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    /// x1, y1, x2, y2
    pub bbox: [f32; 4],
    pub confidence: f32,
    /// eyes, nose, mouth corners
    pub landmarks: [[f32; 2]; 5],
}

const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const NMS_IOU_THRESHOLD: f32 = 0.4;

// det_10g output tensors, grouped by stride 8/16/32. Shapes carry no
// batch dimension: scores [N,1], bboxes [N,4], landmarks [N,10], where
// N = (640/stride)^2 * 2.
const SCORE_OUTPUTS: [&str; 3] = ["448", "471", "494"];
const BBOX_OUTPUTS: [&str; 3] = ["451", "474", "497"];
const LANDMARK_OUTPUTS: [&str; 3] = ["454", "477", "500"];

pub struct Detector {
    session: Mutex<ort::session::Session>,
    threshold: f32,
    input_w: u32,
    input_h: u32,
}

impl Detector {
    pub fn new(
        model_path: &str,
        threshold: f32,
        intra_threads: usize,
        inter_threads: usize,
    ) -> Result<Self> {
        let session = build_session(model_path, intra_threads, inter_threads)
            .context("create detector session")?;
        Ok(Self {
            session: Mutex::new(session),
            threshold,
            input_w: 640,
            input_h: 640,
        })
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_w, self.input_h)
    }

    /// Run detection on a preprocessed CHW tensor ([3, 640, 640],
    /// normalised). `orig_w`/`orig_h` scale boxes back to frame pixels.
    pub fn detect(&self, input: Vec<f32>, orig_w: u32, orig_h: u32) -> Result<Vec<Detection>> {
        let shape = [1usize, 3, self.input_h as usize, self.input_w as usize];
        let array = Array::from_shape_vec(IxDyn(&shape), input).context("shape detector input")?;
        let tensor = Value::from_array(array)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("lock detector session: {e}"))?;
        let outputs = session.run(ort::inputs![tensor])?;

        let mut detections = Vec::new();
        for (si, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs
                .get(SCORE_OUTPUTS[si])
                .with_context(|| format!("missing output {}", SCORE_OUTPUTS[si]))?
                .try_extract_tensor::<f32>()?;
            let (_, bboxes) = outputs
                .get(BBOX_OUTPUTS[si])
                .with_context(|| format!("missing output {}", BBOX_OUTPUTS[si]))?
                .try_extract_tensor::<f32>()?;
            let (_, landmarks) = outputs
                .get(LANDMARK_OUTPUTS[si])
                .with_context(|| format!("missing output {}", LANDMARK_OUTPUTS[si]))?
                .try_extract_tensor::<f32>()?;

            decode_stride(
                scores,
                bboxes,
                landmarks,
                stride,
                self.input_w as usize,
                self.input_h as usize,
                orig_w,
                orig_h,
                self.threshold,
                &mut detections,
            );
        }

        Ok(nms(detections, NMS_IOU_THRESHOLD))
    }
}

/// Decode one stride's anchor grid into detections above `threshold`.
/// Box edges are model outputs in stride units, measured outward from
/// the anchor centre; everything is clamped to the original frame.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    landmarks: &[f32],
    stride: usize,
    input_w: usize,
    input_h: usize,
    orig_w: u32,
    orig_h: u32,
    threshold: f32,
    out: &mut Vec<Detection>,
) {
    let fm_w = input_w / stride;
    let fm_h = input_h / stride;
    let expected = fm_w * fm_h * ANCHORS_PER_CELL;
    if scores.len() < expected || bboxes.len() < expected * 4 || landmarks.len() < expected * 10 {
        return;
    }

    let scale_w = orig_w as f32 / input_w as f32;
    let scale_h = orig_h as f32 / input_h as f32;
    let st = stride as f32;

    let mut idx = 0usize;
    for cy in 0..fm_h {
        for cx in 0..fm_w {
            for _anchor in 0..ANCHORS_PER_CELL {
                let score = scores[idx];
                if score >= threshold {
                    let anchor_x = cx as f32 * st;
                    let anchor_y = cy as f32 * st;

                    let x1 = ((anchor_x - bboxes[idx * 4] * st) * scale_w).clamp(0.0, orig_w as f32);
                    let y1 =
                        ((anchor_y - bboxes[idx * 4 + 1] * st) * scale_h).clamp(0.0, orig_h as f32);
                    let x2 =
                        ((anchor_x + bboxes[idx * 4 + 2] * st) * scale_w).clamp(0.0, orig_w as f32);
                    let y2 =
                        ((anchor_y + bboxes[idx * 4 + 3] * st) * scale_h).clamp(0.0, orig_h as f32);

                    let mut lm = [[0f32; 2]; 5];
                    for (li, point) in lm.iter_mut().enumerate() {
                        point[0] = (anchor_x + landmarks[idx * 10 + li * 2] * st) * scale_w;
                        point[1] = (anchor_y + landmarks[idx * 10 + li * 2 + 1] * st) * scale_h;
                    }

                    out.push(Detection {
                        bbox: [x1, y1, x2, y2],
                        confidence: score,
                        landmarks: lm,
                    });
                }
                idx += 1;
            }
        }
    }
}

/// Non-maximum suppression, highest confidence first. The sort is
/// stable, so equal confidences keep their input order.
pub(crate) fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep = vec![true; detections.len()];
    for i in 0..detections.len() {
        if !keep[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if keep[j] && iou(&detections[i].bbox, &detections[j].bbox) > iou_threshold {
                keep[j] = false;
            }
        }
    }

    detections
        .into_iter()
        .zip(keep)
        .filter_map(|(d, k)| k.then_some(d))
        .collect()
}

pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox,
            confidence,
            landmarks: [[0.0; 2]; 5],
        }
    }

    fn decode_stride32(
        scores: &[f32],
        bboxes: &[f32],
        landmarks: &[f32],
        threshold: f32,
    ) -> Vec<Detection> {
        let mut out = Vec::new();
        decode_stride(
            scores, bboxes, landmarks, 32, 640, 640, 640, 640, threshold, &mut out,
        );
        out
    }

    #[test]
    fn iou_identical_and_disjoint() {
        let a = [10.0, 10.0, 60.0, 60.0];
        let b = [100.0, 100.0, 150.0, 150.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-3);
        assert_eq!(iou(&a, &b), 0.0);

        let c = [30.0, 30.0, 80.0, 80.0];
        let partial = iou(&a, &c);
        assert!(partial > 0.0 && partial < 1.0);
    }

    #[test]
    fn decode_recovers_anchor_relative_box() {
        // stride 32 grid is 20x20, 2 anchors per cell: 800 entries
        let mut scores = vec![0f32; 800];
        let mut bboxes = vec![0f32; 800 * 4];
        let landmarks = vec![0f32; 800 * 10];

        // cell (cx=10, cy=5), anchor 0
        let idx = (5 * 20 + 10) * 2;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let out = decode_stride32(&scores, &bboxes, &landmarks, 0.5);
        assert_eq!(out.len(), 1);
        let d = &out[0];
        // anchor centre (320, 160), one stride in every direction
        assert_eq!(d.bbox, [288.0, 128.0, 352.0, 192.0]);
        assert_eq!(d.confidence, 0.9);
    }

    #[test]
    fn decode_applies_confidence_floor() {
        let mut scores = vec![0f32; 800];
        scores[0] = 0.49;
        let bboxes = vec![0f32; 800 * 4];
        let landmarks = vec![0f32; 800 * 10];
        let out = decode_stride32(&scores, &bboxes, &landmarks, 0.5);
        assert!(out.is_empty());
    }

    #[test]
    fn decode_clamps_to_frame_bounds() {
        let mut scores = vec![0f32; 800];
        let mut bboxes = vec![0f32; 800 * 4];
        let landmarks = vec![0f32; 800 * 10];

        // cell (0,0): large distances push x1/y1 negative and x2/y2 past
        // the frame edge before clamping
        scores[0] = 0.8;
        bboxes[0..4].copy_from_slice(&[5.0, 5.0, 1000.0, 1000.0]);

        let out = decode_stride32(&scores, &bboxes, &landmarks, 0.5);
        assert_eq!(out.len(), 1);
        let [x1, y1, x2, y2] = out[0].bbox;
        assert_eq!((x1, y1), (0.0, 0.0));
        assert_eq!((x2, y2), (640.0, 640.0));
    }

    #[test]
    fn nms_suppresses_overlaps_keeping_highest() {
        let boxes = vec![
            det([10.0, 10.0, 60.0, 60.0], 0.9),
            det([15.0, 15.0, 65.0, 65.0], 0.8),
            det([100.0, 100.0, 150.0, 150.0], 0.85),
        ];
        let kept = nms(boxes, 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.85);
    }

    #[test]
    fn nms_is_deterministic_for_equal_confidences() {
        let first = det([10.0, 10.0, 60.0, 60.0], 0.7);
        let second = det([12.0, 12.0, 62.0, 62.0], 0.7);
        let kept = nms(vec![first.clone(), second], 0.4);
        assert_eq!(kept.len(), 1);
        // stable sort: the earlier input wins the tie
        assert_eq!(kept[0].bbox, first.bbox);
    }
}
