//! 类别感知的非极大值抑制 (Class-aware NMS)

use serde::{Deserialize, Serialize};

use super::types::{BoundingBox, DEFAULT_IOU_THRESHOLD};
use crate::error::{Error, Result};

/// 已校验的IOU阈值, 取值范围 `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct IouThreshold(f32);

impl IouThreshold {
    /// 超出范围直接报错, 不做裁剪
    pub fn new(value: f32) -> Result<Self> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::InvalidIouThreshold(value))
        }
    }

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for IouThreshold {
    fn default() -> Self {
        Self(DEFAULT_IOU_THRESHOLD)
    }
}

impl TryFrom<f32> for IouThreshold {
    type Error = Error;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<IouThreshold> for f32 {
    fn from(value: IouThreshold) -> Self {
        value.0
    }
}

/// 贪心NMS, 只在同类别之间抑制
///
/// 按置信度降序 (稳定排序) 遍历; 被选中的框会关闭后面所有
/// 同类别且 `IOU > iou_threshold` 的框. 输出保持置信度降序.
pub fn non_max_suppression(boxes: &[BoundingBox], iou_threshold: IouThreshold) -> Vec<BoundingBox> {
    let iou_threshold = iou_threshold.get();

    let mut sorted = boxes.to_vec();
    sorted.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut active = vec![true; sorted.len()];
    let mut selected = Vec::new();

    for i in 0..sorted.len() {
        if !active[i] {
            continue;
        }
        selected.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if !active[j] || sorted[i].class_index != sorted[j].class_index {
                continue;
            }
            if sorted[i].iou(&sorted[j]) > iou_threshold {
                active[j] = false;
            }
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_index: usize) -> BoundingBox {
        BoundingBox {
            x1,
            y1,
            x2,
            y2,
            cx: (x1 + x2) / 2.,
            cy: (y1 + y2) / 2.,
            w: x2 - x1,
            h: y2 - y1,
            confidence,
            class_index,
        }
    }

    #[test]
    fn test_threshold_validation() {
        assert!(IouThreshold::new(0.0).is_ok());
        assert!(IouThreshold::new(1.0).is_ok());
        assert!(matches!(
            IouThreshold::new(1.5),
            Err(Error::InvalidIouThreshold(v)) if v == 1.5
        ));
        assert!(IouThreshold::new(-0.1).is_err());
        assert!(IouThreshold::new(f32::NAN).is_err());
        assert_eq!(IouThreshold::default().get(), 0.7);
    }

    #[test]
    fn test_same_class_overlap_keeps_highest() {
        // 0.5x0.5 与其 90% 面积重叠的框: IOU = 0.9
        let a = bbox(0.0, 0.0, 0.5, 0.5, 0.8, 0);
        let b = bbox(0.0, 0.0, 0.5, 0.45, 0.9, 0);
        assert!((a.iou(&b) - 0.9).abs() < 1e-5);

        let kept = non_max_suppression(&[a, b], IouThreshold::new(0.7).unwrap());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_different_classes_never_suppress() {
        let a = bbox(0.0, 0.0, 0.5, 0.5, 0.9, 0);
        let b = bbox(0.0, 0.0, 0.5, 0.475, 0.8, 1);
        assert!((a.iou(&b) - 0.95).abs() < 1e-5);

        for theta in [0.0, 0.5, 0.7, 1.0] {
            let kept = non_max_suppression(&[a, b], IouThreshold::new(theta).unwrap());
            assert_eq!(kept.len(), 2);
        }
    }

    #[test]
    fn test_output_is_confidence_descending_and_stable() {
        let a = bbox(0.0, 0.0, 0.1, 0.1, 0.5, 0);
        let b = bbox(0.5, 0.5, 0.6, 0.6, 0.9, 0);
        let c = bbox(0.8, 0.8, 0.9, 0.9, 0.5, 1);
        let kept = non_max_suppression(&[a, b, c], IouThreshold::default());
        assert_eq!(kept, vec![b, a, c]);
    }

    #[test]
    fn test_no_same_class_survivors_above_threshold_and_idempotent() {
        let mut boxes = Vec::new();
        for i in 0..40 {
            let o = (i % 7) as f32 * 0.03;
            let conf = 0.3 + (i * 37 % 60) as f32 / 100.0;
            boxes.push(bbox(0.1 + o, 0.1 + o, 0.5 + o, 0.5 + o, conf, i % 3));
        }

        for theta in [0.1, 0.3, 0.5, 0.7, 0.9] {
            let threshold = IouThreshold::new(theta).unwrap();
            let kept = non_max_suppression(&boxes, threshold);

            for (i, a) in kept.iter().enumerate() {
                for b in kept.iter().skip(i + 1) {
                    if a.class_index == b.class_index {
                        assert!(a.iou(b) <= theta);
                    }
                }
            }

            assert_eq!(non_max_suppression(&kept, threshold), kept);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(non_max_suppression(&[], IouThreshold::default()).is_empty());
    }
}
