//! 检测张量解码 (BoxDecoder)
//!
//! 输出格式 `[1, 4 + nc, num_anchors]`, 与 YOLOv8 导出格式一致

use super::types::{BoundingBox, DetectionTensor, CXYWH_OFFSET};

/// 将一次推理的输出解码为候选框
///
/// - 每个 anchor 取置信度最高的类别 (严格大于, 相同置信度保留靠前的类别)
/// - `max_conf <= conf_threshold` 的 anchor 直接跳过
/// - 任一角点超出 `[0, 1]` 的框被丢弃, 不做裁剪
pub fn decode_boxes(tensor: &DetectionTensor, conf_threshold: f32) -> Vec<BoundingBox> {
    let num_channels = tensor.num_channels();
    let mut boxes = Vec::new();

    for c in 0..tensor.num_elements() {
        let mut max_conf = f32::NEG_INFINITY;
        let mut class_index = 0usize;
        for j in CXYWH_OFFSET..num_channels {
            let conf = tensor.get(j, c);
            if conf > max_conf {
                max_conf = conf;
                class_index = j - CXYWH_OFFSET;
            }
        }

        // NaN 也不会通过这里
        if !(max_conf > conf_threshold) {
            continue;
        }

        let bbox = BoundingBox::from_cxcywh(
            tensor.get(0, c),
            tensor.get(1, c),
            tensor.get(2, c),
            tensor.get(3, c),
            max_conf,
            class_index,
        );

        if !in_unit_range(bbox.x1)
            || !in_unit_range(bbox.y1)
            || !in_unit_range(bbox.x2)
            || !in_unit_range(bbox.y2)
        {
            continue;
        }

        boxes.push(bbox);
    }

    boxes
}

#[inline]
fn in_unit_range(v: f32) -> bool {
    (0.0..=1.0).contains(&v)
}
