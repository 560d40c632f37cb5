/// 推理引擎统一接口
///
/// # 架构说明
///
/// 检测器只依赖 [`InferenceEngine`] trait:
/// - 输入: NCHW `[1, 3, H, W]` 的 f32 张量, 像素归一化到 `[0, 1]`
/// - 输出: `[1, num_channels, num_elements]` 的 f32 张量
///
/// 具体实现:
/// - **OrtEngine**: ONNX Runtime 后端 (feature `onnx`), 文件 `onnx.rs`
///
/// ## 使用示例
/// ```ignore
/// use tricycle_detector::models::{ExecutionProvider, OrtConfig, OrtEngine};
///
/// let engine = OrtEngine::build(OrtConfig {
///     model: "models/tricycle.onnx".into(),
///     provider: ExecutionProvider::Cuda(0),
///     input_size: (640, 640),
/// })?;
/// ```
use anyhow::Result;
use ndarray::{Array4, ArrayD};

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    /// CUDA GPU (device id)
    Cuda(i32),
    /// 纯CPU
    Cpu,
}

impl ExecutionProvider {
    pub fn name(&self) -> &str {
        match self {
            ExecutionProvider::Cuda(_) => "CUDA",
            ExecutionProvider::Cpu => "CPU",
        }
    }
}

/// 推理引擎 (非线程安全, 只在检测线程中使用)
pub trait InferenceEngine: Send {
    /// 输入尺寸 (width, height)
    fn input_shape(&self) -> (u32, u32);

    /// 输出形状 (num_channels, num_elements)
    fn output_shape(&self) -> (usize, usize);

    /// 执行一次前向推理
    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>>;
}

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{engine_factory, OrtConfig, OrtEngine};
