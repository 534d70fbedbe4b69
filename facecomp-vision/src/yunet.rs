//! YuNet post-processing: anchor-free grid decoding.
//!
//! For each stride (8, 16, 32) the network emits four tensors, grouped by kind:
//! `cls_*`, `obj_*`, `bbox_*`, `kps_*`, each shaped `[1, H*W, C]`.
//! A grid cell (i, j) decodes as
//! `cx = (j + dx) * stride`, `cy = (i + dy) * stride`,
//! `w = dw * stride`, `h = dh * stride`, all divided by the input size.

use anyhow::Result;
use ndarray::Array2;

const STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Debug, Clone)]
pub struct RawDetection {
    pub bbox: [f32; 4], // x, y, w, h (normalized [0,1])
    pub score: f32,
    pub landmarks: [f32; 10], // normalized [0,1]
}

/// Decode per-stride score, box and landmark maps into normalized detections.
pub fn decode_detections(
    cls_scores: Vec<Array2<f32>>,
    bbox_preds: Vec<Array2<f32>>,
    landmark_preds: Vec<Array2<f32>>,
    score_threshold: f32,
    input_size: usize,
) -> Result<Vec<RawDetection>> {
    let mut detections = Vec::new();

    for (scale_idx, &stride) in STRIDES.iter().enumerate() {
        let (Some(scores), Some(bboxes), Some(landmarks)) = (
            cls_scores.get(scale_idx),
            bbox_preds.get(scale_idx),
            landmark_preds.get(scale_idx),
        ) else {
            anyhow::bail!("missing outputs for stride {}", stride);
        };

        let feature_size = input_size / stride;
        let num_boxes = scores.shape()[0];
        if num_boxes != feature_size * feature_size {
            anyhow::bail!(
                "Expected {} boxes for stride {} ({}x{} grid), got {}",
                feature_size * feature_size,
                stride,
                feature_size,
                feature_size,
                num_boxes
            );
        }

        let norm = stride as f32 / input_size as f32;
        for i in 0..feature_size {
            for j in 0..feature_size {
                let idx = i * feature_size + j;
                let score = scores[[idx, 0]];
                if score < score_threshold {
                    continue;
                }

                let cx = (j as f32 + bboxes[[idx, 0]]) * norm;
                let cy = (i as f32 + bboxes[[idx, 1]]) * norm;
                let w = bboxes[[idx, 2]] * norm;
                let h = bboxes[[idx, 3]] * norm;

                let mut lms = [0.0f32; 10];
                for k in 0..5 {
                    lms[k * 2] = (j as f32 + landmarks[[idx, k * 2]]) * norm;
                    lms[k * 2 + 1] = (i as f32 + landmarks[[idx, k * 2 + 1]]) * norm;
                }

                detections.push(RawDetection {
                    bbox: [cx - w / 2.0, cy - h / 2.0, w, h],
                    score,
                    landmarks: lms,
                });
            }
        }
    }

    Ok(detections)
}

/// Read one group of three per-stride tensors starting at output `first`,
/// each expected as `[1, cells, channels]`.
fn parse_group(
    outputs: &[(&[i64], &[f32])],
    first: usize,
    channels: usize,
    kind: &str,
    input_size: usize,
) -> Result<Vec<Array2<f32>>> {
    STRIDES
        .iter()
        .enumerate()
        .map(|(offset, &stride)| {
            let idx = first + offset;
            let cells = (input_size / stride) * (input_size / stride);
            let Some((shape, data)) = outputs.get(idx) else {
                anyhow::bail!("Missing {} output at index {}", kind, idx);
            };
            if shape.len() != 3
                || shape[0] != 1
                || shape[1] as usize != cells
                || shape[2] as usize != channels
            {
                anyhow::bail!(
                    "Unexpected {} shape at index {}: {:?}, expected [1, {}, {}]",
                    kind,
                    idx,
                    shape,
                    cells,
                    channels
                );
            }
            Ok(Array2::from_shape_vec((cells, channels), data.to_vec())?)
        })
        .collect()
}

/// Split the twelve raw YuNet outputs into (scores, boxes, landmarks).
///
/// Output order: cls_8, cls_16, cls_32, obj_8, obj_16, obj_32,
/// bbox_8, bbox_16, bbox_32, kps_8, kps_16, kps_32.
/// Scores are `cls * obj`, still pre-sigmoid.
pub fn parse_yunet_outputs(
    outputs: &[(&[i64], &[f32])],
    input_size: usize,
) -> Result<(Vec<Array2<f32>>, Vec<Array2<f32>>, Vec<Array2<f32>>)> {
    let cls = parse_group(outputs, 0, 1, "cls", input_size)?;
    let obj = parse_group(outputs, 3, 1, "obj", input_size)?;
    let bbox = parse_group(outputs, 6, 4, "bbox", input_size)?;
    let kps = parse_group(outputs, 9, 10, "kps", input_size)?;

    let scores = cls.iter().zip(obj.iter()).map(|(c, o)| c * o).collect();
    Ok((scores, bbox, kps))
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub fn apply_sigmoid_to_scores(scores: &mut [Array2<f32>]) {
    for score_map in scores {
        score_map.mapv_inplace(sigmoid);
    }
}
