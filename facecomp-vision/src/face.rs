use crate::yunet;
use anyhow::Result;
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array1, Array4};
use ort::{session::Session, value::Value};

/// YuNet input edge length.
pub const DETECTOR_INPUT: u32 = 640;
/// SFace input edge length.
pub const ENCODER_INPUT: u32 = 112;

/// Detection result from YuNet, in source image pixels.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
    pub landmarks: [f32; 10], // 5 points: x1,y1,x2,y2,...,x5,y5
}

/// Square canvas holding an aspect-preserving resize of the source.
struct Letterbox {
    canvas: RgbImage,
    scale: f32,
    offset_x: u32,
    offset_y: u32,
}

fn letterbox(img: &RgbImage, target: u32) -> Letterbox {
    let (width, height) = img.dimensions();
    let scale = target as f32 / width.max(height) as f32;
    let new_width = ((width as f32 * scale) as u32).clamp(1, target);
    let new_height = ((height as f32 * scale) as u32).clamp(1, target);
    let resized = imageops::resize(img, new_width, new_height, FilterType::Triangle);

    let mut canvas = RgbImage::new(target, target);
    let offset_x = (target - new_width) / 2;
    let offset_y = (target - new_height) / 2;
    imageops::overlay(&mut canvas, &resized, offset_x as i64, offset_y as i64);

    Letterbox {
        canvas,
        scale,
        offset_x,
        offset_y,
    }
}

/// Planar BGR float tensor data (C, H, W) with values in [0, 255].
pub fn to_bgr_planes(img: &RgbImage) -> Vec<f32> {
    let pixel_count = (img.width() * img.height()) as usize;
    let mut data = vec![0.0f32; 3 * pixel_count];
    let (b_channel, rest) = data.split_at_mut(pixel_count);
    let (g_channel, r_channel) = rest.split_at_mut(pixel_count);

    for (i, px) in img.as_raw().chunks_exact(3).enumerate() {
        r_channel[i] = px[0] as f32;
        g_channel[i] = px[1] as f32;
        b_channel[i] = px[2] as f32;
    }
    data
}

/// Detect faces with YuNet. Results are sorted by descending score after NMS.
pub fn detect_faces(
    session: &mut Session,
    img: &RgbImage,
    score_threshold: f32,
    nms_threshold: f32,
) -> Result<Vec<Detection>> {
    let target_size = DETECTOR_INPUT;
    let boxed = letterbox(img, target_size);

    let input_array = Array4::from_shape_vec(
        (1, 3, target_size as usize, target_size as usize),
        to_bgr_planes(&boxed.canvas),
    )?;
    let input_tensor = Value::from_array(input_array)?;

    let outputs = session.run(ort::inputs![input_tensor])?;

    let mut output_data: Vec<(Vec<i64>, Vec<f32>)> = Vec::new();
    for (_name, output) in outputs.iter() {
        let (shape, data) = output.try_extract_tensor::<f32>()?;
        output_data.push((shape.iter().copied().collect(), data.to_vec()));
    }
    let output_refs: Vec<(&[i64], &[f32])> = output_data
        .iter()
        .map(|(s, d)| (s.as_slice(), d.as_slice()))
        .collect();

    let (mut cls_scores, bbox_preds, landmark_preds) =
        yunet::parse_yunet_outputs(&output_refs, target_size as usize)?;
    yunet::apply_sigmoid_to_scores(&mut cls_scores);

    let raw_detections = yunet::decode_detections(
        cls_scores,
        bbox_preds,
        landmark_preds,
        score_threshold,
        target_size as usize,
    )?;

    // Normalized canvas coordinates -> canvas pixels -> remove padding -> source pixels.
    let to_source = |v: f32, offset: u32| (v * target_size as f32 - offset as f32) / boxed.scale;
    let detections: Vec<Detection> = raw_detections
        .into_iter()
        .map(|d| {
            let mut landmarks = [0.0f32; 10];
            for i in 0..5 {
                landmarks[i * 2] = to_source(d.landmarks[i * 2], boxed.offset_x);
                landmarks[i * 2 + 1] = to_source(d.landmarks[i * 2 + 1], boxed.offset_y);
            }
            Detection {
                bbox: [
                    to_source(d.bbox[0], boxed.offset_x),
                    to_source(d.bbox[1], boxed.offset_y),
                    d.bbox[2] * target_size as f32 / boxed.scale,
                    d.bbox[3] * target_size as f32 / boxed.scale,
                ],
                score: d.score,
                landmarks,
            }
        })
        .collect();

    Ok(nms(&detections, nms_threshold))
}

/// Non-maximum suppression. Output is ordered by descending score.
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
    if iou_threshold >= 1.0 {
        return sorted;
    }

    let mut keep: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..sorted.len() {
            if !suppressed[j] && compute_iou(&sorted[i].bbox, &sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(sorted[i].clone());
    }

    keep
}

fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    let area_a = a[2] * a[3];
    let area_b = b[2] * b[3];
    inter / (area_a + area_b - inter)
}

/// Rotate, scale and translate the face so the eyes land on the ArcFace
/// reference positions of a `size` x `size` crop.
pub fn align_face(img: &RgbImage, landmarks: &[f32; 10], size: u32) -> RgbImage {
    let ref_left_eye = (38.3_f32, 51.7_f32);
    let ref_right_eye = (73.5_f32, 51.5_f32);

    let left_eye = (landmarks[0], landmarks[1]);
    let right_eye = (landmarks[2], landmarks[3]);

    let eye_dx = right_eye.0 - left_eye.0;
    let eye_dy = right_eye.1 - left_eye.1;
    let eye_angle = eye_dy.atan2(eye_dx);

    let ref_eye_dist = ((ref_right_eye.0 - ref_left_eye.0).powi(2)
        + (ref_right_eye.1 - ref_left_eye.1).powi(2))
    .sqrt();
    let actual_eye_dist = (eye_dx * eye_dx + eye_dy * eye_dy).sqrt().max(1e-3);
    let scale = (size as f32 / ENCODER_INPUT as f32) * (ref_eye_dist / actual_eye_dist);

    let eye_center = (
        (left_eye.0 + right_eye.0) / 2.0,
        (left_eye.1 + right_eye.1) / 2.0,
    );
    let ref_center = (
        (ref_left_eye.0 + ref_right_eye.0) / 2.0 * size as f32 / ENCODER_INPUT as f32,
        (ref_left_eye.1 + ref_right_eye.1) / 2.0 * size as f32 / ENCODER_INPUT as f32,
    );

    // output = [a b; c d] * input + [tx ty]
    let a = scale * eye_angle.cos();
    let b = scale * eye_angle.sin();
    let c = -b;
    let d = a;
    let tx = ref_center.0 - (a * eye_center.0 + b * eye_center.1);
    let ty = ref_center.1 - (c * eye_center.0 + d * eye_center.1);
    let det = a * d - b * c;

    let (img_w, img_h) = img.dimensions();
    let mut output = RgbImage::new(size, size);

    for out_y in 0..size {
        for out_x in 0..size {
            let tmp_x = out_x as f32 - tx;
            let tmp_y = out_y as f32 - ty;
            let in_x = (d * tmp_x - b * tmp_y) / det;
            let in_y = (-c * tmp_x + a * tmp_y) / det;

            if in_x < 0.0 || in_x >= img_w as f32 || in_y < 0.0 || in_y >= img_h as f32 {
                continue; // outside the source stays black
            }

            let x0 = in_x.floor() as u32;
            let y0 = in_y.floor() as u32;
            let x1 = (x0 + 1).min(img_w - 1);
            let y1 = (y0 + 1).min(img_h - 1);
            let fx = in_x - x0 as f32;
            let fy = in_y - y0 as f32;

            let p00 = img.get_pixel(x0, y0);
            let p10 = img.get_pixel(x1, y0);
            let p01 = img.get_pixel(x0, y1);
            let p11 = img.get_pixel(x1, y1);

            let w00 = (1.0 - fx) * (1.0 - fy);
            let w10 = fx * (1.0 - fy);
            let w01 = (1.0 - fx) * fy;
            let w11 = fx * fy;

            let mut px = [0u8; 3];
            for (ch, out) in px.iter_mut().enumerate() {
                *out = (p00[ch] as f32 * w00
                    + p10[ch] as f32 * w10
                    + p01[ch] as f32 * w01
                    + p11[ch] as f32 * w11) as u8;
            }
            output.put_pixel(out_x, out_y, Rgb(px));
        }
    }

    output
}

/// Encode a face crop with SFace and L2-normalize the result.
pub fn encode_face(session: &mut Session, face_img: &RgbImage) -> Result<Array1<f32>> {
    let size = ENCODER_INPUT;
    let face = imageops::resize(face_img, size, size, FilterType::Triangle);

    let input_array =
        Array4::from_shape_vec((1, 3, size as usize, size as usize), to_bgr_planes(&face))?;
    let input_tensor = Value::from_array(input_array)?;

    let outputs = session.run(ort::inputs![input_tensor])?;
    let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

    // Expecting shape [1, 128]
    let embedding_size = if shape.len() == 2 {
        shape[1] as usize
    } else {
        data.len()
    };
    Ok(l2_normalize(Array1::from(data[0..embedding_size].to_vec())))
}

pub fn l2_normalize(mut v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v.mapv_inplace(|x| x / norm);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], score: f32) -> Detection {
        Detection {
            bbox,
            score,
            landmarks: [0.0; 10],
        }
    }

    #[test]
    fn test_iou() {
        let a = [10.0, 10.0, 20.0, 20.0];
        let b = [15.0, 15.0, 20.0, 20.0];
        let iou = compute_iou(&a, &b);
        assert!(iou > 0.0 && iou < 1.0);

        // No overlap
        let c = [100.0, 100.0, 10.0, 10.0];
        assert_eq!(compute_iou(&a, &c), 0.0);
    }

    #[test]
    fn test_nms_orders_by_score() {
        let detections = vec![
            det([10.0, 10.0, 20.0, 20.0], 0.8),
            det([12.0, 12.0, 20.0, 20.0], 0.9),
            det([100.0, 100.0, 20.0, 20.0], 0.85),
        ];

        let result = nms(&detections, 0.3);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].score, 0.9);
        assert_eq!(result[1].score, 0.85);
    }

    #[test]
    fn test_letterbox_keeps_aspect() {
        let img = RgbImage::from_pixel(320, 160, Rgb([255, 0, 0]));
        let boxed = letterbox(&img, 640);
        assert_eq!(boxed.canvas.dimensions(), (640, 640));
        assert_eq!(boxed.scale, 2.0);
        assert_eq!((boxed.offset_x, boxed.offset_y), (0, 160));
        assert_eq!(boxed.canvas.get_pixel(320, 10), &Rgb([0, 0, 0]));
        assert_eq!(boxed.canvas.get_pixel(320, 320), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_bgr_planes() {
        let img = RgbImage::from_fn(2, 1, |x, _| Rgb([10 + x as u8, 20, 30]));
        assert_eq!(
            to_bgr_planes(&img),
            vec![30.0, 30.0, 20.0, 20.0, 10.0, 11.0]
        );
    }

    #[test]
    fn test_align_identity_landmarks() {
        // Eyes already at the reference positions: alignment is a no-op.
        let img = RgbImage::from_fn(112, 112, |x, y| Rgb([x as u8, y as u8, 0]));
        let landmarks = [38.3, 51.7, 73.5, 51.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let aligned = align_face(&img, &landmarks, 112);
        let px = aligned.get_pixel(56, 56);
        assert!((px[0] as i32 - 56).abs() <= 1);
        assert!((px[1] as i32 - 56).abs() <= 1);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(Array1::from(vec![3.0, 4.0]));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let zero = l2_normalize(Array1::from(vec![0.0, 0.0]));
        assert_eq!(zero.to_vec(), vec![0.0, 0.0]);
    }
}
