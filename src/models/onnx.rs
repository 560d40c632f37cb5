// ONNX Runtime 推理后端
// 包含: 模型加载、执行设备选择、推理

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ndarray::{Array, Array4, ArrayD, IxDyn};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::Session;
use ort::value::TensorRef;

use super::{ExecutionProvider, InferenceEngine};

/// ONNX 引擎配置
#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub model: PathBuf,
    pub provider: ExecutionProvider,
    /// 模型输入尺寸 (width, height)
    pub input_size: (u32, u32),
}

pub struct OrtEngine {
    session: Session,
    provider: ExecutionProvider,
    input_size: (u32, u32),
    output_shape: (usize, usize),
}

impl OrtEngine {
    /// 加载模型, 并用一次空推理确定输出形状
    pub fn build(config: OrtConfig) -> Result<Self> {
        let builder = Session::builder().context("Failed to create ONNX session builder")?;
        let builder = match config.provider {
            ExecutionProvider::Cuda(device_id) => builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure()])
                .context("Failed to register CUDA execution provider")?,
            ExecutionProvider::Cpu => builder
                .with_execution_providers([CPUExecutionProvider::default().build()])
                .context("Failed to register CPU execution provider")?,
        };
        let session = builder
            .commit_from_file(&config.model)
            .with_context(|| format!("Failed to load ONNX model from {}", config.model.display()))?;

        let mut engine = Self {
            session,
            provider: config.provider,
            input_size: config.input_size,
            output_shape: (0, 0),
        };

        let (w, h) = config.input_size;
        let dummy = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        let ys = engine.run(&dummy).context("Warm-up inference failed")?;
        match ys.shape() {
            [1, channels, elements] => engine.output_shape = (*channels, *elements),
            other => bail!("Unexpected output shape {:?}, expected [1, channels, anchors]", other),
        }

        log::info!(
            "✅ ONNX模型加载成功: {} | {} | 输入 {}x{} | 输出 {:?}",
            config.model.display(),
            engine.provider.name(),
            w,
            h,
            engine.output_shape
        );

        Ok(engine)
    }

    pub fn provider(&self) -> ExecutionProvider {
        self.provider
    }
}

impl InferenceEngine for OrtEngine {
    fn input_shape(&self) -> (u32, u32) {
        self.input_size
    }

    fn output_shape(&self) -> (usize, usize) {
        self.output_shape
    }

    fn run(&mut self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = TensorRef::from_array_view(input.view())?;
        let outputs = self.session.run(ort::inputs![input_tensor])?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
        let ys = Array::from_shape_vec(IxDyn(&dims), data.to_vec())?;

        Ok(ys)
    }
}

/// 检测器使用的引擎工厂: 按执行设备创建 [`OrtEngine`]
pub fn engine_factory(
    model: PathBuf,
    input_size: (u32, u32),
) -> impl Fn(ExecutionProvider) -> Result<Box<dyn InferenceEngine>> {
    move |provider| {
        let engine = OrtEngine::build(OrtConfig {
            model: model.clone(),
            provider,
            input_size,
        })?;
        Ok(Box::new(engine) as Box<dyn InferenceEngine>)
    }
}
