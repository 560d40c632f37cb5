/// 检测系统 (Detection System)
///
/// 独立工作线程,负责目标检测:
/// - decode:   原始输出张量 → 候选框
/// - nms:      同类别非极大值抑制
/// - detector: 推理线程 + 事件通知
/// - render:   标注副本 (框 + 标签)
pub mod decode;
pub mod detector;
pub mod nms;
pub mod render;
pub mod types;

pub use decode::decode_boxes;
pub use detector::{Completion, DetectionOutcome, Detector, DetectorListener, NoopListener};
pub use nms::{non_max_suppression, IouThreshold};
pub use render::Annotator;
pub use types::{BoundingBox, DetectionTensor, DEFAULT_CONF_THRESHOLD, DEFAULT_IOU_THRESHOLD};
