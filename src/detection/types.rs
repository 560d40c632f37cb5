/// 检测系统数据结构定义
/// Data structures for the detection system
use ndarray::{Array3, ArrayD, Ix3};

use crate::error::{Error, Result};

// ========== 公共常量 ==========

/// 默认置信度阈值
pub const DEFAULT_CONF_THRESHOLD: f32 = 0.25;

/// 默认NMS IOU阈值
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.7;

/// 前4个通道为 cx, cy, w, h
pub const CXYWH_OFFSET: usize = 4;

// ========== 数据结构 ==========

/// 检测框 (Detection bounding box)
///
/// 所有坐标归一化到 `[0, 1]`; 由解码器创建后不可变
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub confidence: f32,
    pub class_index: usize,
}

impl BoundingBox {
    /// 由中心点+宽高构造
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32, confidence: f32, class_index: usize) -> Self {
        Self {
            x1: cx - w / 2.,
            y1: cy - h / 2.,
            x2: cx + w / 2.,
            y2: cy + h / 2.,
            cx,
            cy,
            w,
            h,
            confidence,
            class_index,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 两个轴对齐矩形的交集面积 (任一轴不重叠时为0)
    pub fn intersection_area(&self, another: &BoundingBox) -> f32 {
        let l = self.x1.max(another.x1);
        let t = self.y1.max(another.y1);
        let r = self.x2.min(another.x2);
        let b = self.y2.min(another.y2);
        if r <= l || b <= t {
            return 0.;
        }
        (r - l) * (b - t)
    }

    pub fn union(&self, another: &BoundingBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &BoundingBox) -> f32 {
        let union = self.union(another);
        if union > 0. {
            self.intersection_area(another) / union
        } else {
            0.
        }
    }

    /// 转换到像素坐标 (x1, y1, x2, y2)
    pub fn to_pixels(&self, width: u32, height: u32) -> (f32, f32, f32, f32) {
        let (w, h) = (width as f32, height as f32);
        (self.x1 * w, self.y1 * h, self.x2 * w, self.y2 * h)
    }
}

/// 检测输出张量 `[1, num_channels, num_elements]`
///
/// - 通道 0..4: cx, cy, w, h (归一化)
/// - 通道 4..: 每个类别的置信度
#[derive(Debug, Clone)]
pub struct DetectionTensor {
    data: Array3<f32>,
}

impl DetectionTensor {
    /// 从推理引擎的原始输出构造, 校验形状
    pub fn from_array(xs: ArrayD<f32>) -> Result<Self> {
        let shape = xs.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] <= CXYWH_OFFSET {
            return Err(Error::TensorShape(shape));
        }
        let data = xs
            .into_dimensionality::<Ix3>()
            .map_err(|_| Error::TensorShape(shape))?;
        Ok(Self { data })
    }

    /// 从按 `[channel][element]` 排列的扁平数组构造
    pub fn from_flat(num_channels: usize, num_elements: usize, data: Vec<f32>) -> Result<Self> {
        let shape = vec![1, num_channels, num_elements];
        if num_channels <= CXYWH_OFFSET {
            return Err(Error::TensorShape(shape));
        }
        let data = Array3::from_shape_vec((1, num_channels, num_elements), data)
            .map_err(|_| Error::TensorShape(shape))?;
        Ok(Self { data })
    }

    pub fn num_channels(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn num_elements(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn num_classes(&self) -> usize {
        self.num_channels() - CXYWH_OFFSET
    }

    /// 读取某个 anchor 的某个通道
    #[inline]
    pub fn get(&self, channel: usize, element: usize) -> f32 {
        self.data[[0, channel, element]]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = BoundingBox::from_cxcywh(0.5, 0.5, 0.2, 0.2, 0.9, 0);
        let b = BoundingBox::from_cxcywh(0.1, 0.1, 0.1, 0.1, 0.9, 0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_touching_edges_is_zero() {
        let a = BoundingBox::from_cxcywh(0.25, 0.5, 0.5, 0.5, 0.9, 0);
        let b = BoundingBox::from_cxcywh(0.75, 0.5, 0.5, 0.5, 0.9, 0);
        assert_eq!(a.intersection_area(&b), 0.0);
    }

    #[test]
    fn test_tensor_shape_validation() {
        assert!(DetectionTensor::from_flat(4, 2, vec![0.0; 8]).is_err());
        assert!(DetectionTensor::from_flat(6, 2, vec![0.0; 11]).is_err());

        let t = DetectionTensor::from_flat(6, 2, (0..12).map(|x| x as f32).collect()).unwrap();
        assert_eq!(t.num_classes(), 2);
        assert_eq!(t.get(1, 0), 2.0);
        assert_eq!(t.get(5, 1), 11.0);

        let bad = ArrayD::<f32>::zeros(vec![2, 6, 3]);
        assert!(DetectionTensor::from_array(bad).is_err());
        let ok = ArrayD::<f32>::zeros(vec![1, 84, 8400]);
        assert_eq!(DetectionTensor::from_array(ok).unwrap().num_elements(), 8400);
    }
}
