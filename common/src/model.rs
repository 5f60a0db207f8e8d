use std::ops::Range;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::types::LABEL_COUNT;

pub const SUPPORTED_SCHEMA_VERSION: u32 = 3;
pub const MODEL_INPUTS: usize = 2;
pub const MODEL_OUTPUTS: usize = LABEL_COUNT;

pub static EMBEDDED_MODEL: &[u8] = include_bytes!("../model/weather_mlp.json");

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model is not readable: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model provided is schema version {model} not equal to supported version {supported}")]
    VersionMismatch { model: u32, supported: u32 },
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("AllocateTensors() failed: {required} bytes required, arena holds {available}")]
    AllocationFailed { required: usize, available: usize },
    #[error("tensors have not been allocated")]
    NotAllocated,
    #[error("invoke failed: {0}")]
    InvokeFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Softmax,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseLayer {
    fn input_width(&self) -> usize {
        self.weights.first().map(Vec::len).unwrap_or(0)
    }

    fn output_width(&self) -> usize {
        self.weights.len()
    }
}

#[derive(Debug, Deserialize)]
struct SchemaHeader {
    schema_version: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub schema_version: u32,
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
    pub layers: Vec<DenseLayer>,
}

impl ModelSpec {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InferenceError> {
        let header: SchemaHeader = serde_json::from_slice(bytes)?;
        if header.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(InferenceError::VersionMismatch {
                model: header.schema_version,
                supported: SUPPORTED_SCHEMA_VERSION,
            });
        }

        let spec: ModelSpec = serde_json::from_slice(bytes)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), InferenceError> {
        if self.inputs != MODEL_INPUTS || self.outputs != MODEL_OUTPUTS {
            return Err(InferenceError::InvalidModel(format!(
                "expected {MODEL_INPUTS} inputs and {MODEL_OUTPUTS} outputs, model declares {} and {}",
                self.inputs, self.outputs
            )));
        }
        if self.layers.is_empty() {
            return Err(InferenceError::InvalidModel("model has no layers".to_string()));
        }

        let mut width = self.inputs;
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.output_width() == 0 {
                return Err(InferenceError::InvalidModel(format!("layer {index} is empty")));
            }
            if layer.weights.iter().any(|row| row.len() != width) {
                return Err(InferenceError::InvalidModel(format!(
                    "layer {index} expects {} inputs, previous width is {width}",
                    layer.input_width()
                )));
            }
            if layer.bias.len() != layer.output_width() {
                return Err(InferenceError::InvalidModel(format!(
                    "layer {index} has {} biases for {} units",
                    layer.bias.len(),
                    layer.output_width()
                )));
            }
            width = layer.output_width();
        }

        if width != self.outputs {
            return Err(InferenceError::InvalidModel(format!(
                "last layer produces {width} values, model declares {}",
                self.outputs
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct TensorArena {
    cells: Box<[f32]>,
}

impl TensorArena {
    pub fn with_bytes(bytes: usize) -> Self {
        let len = bytes / std::mem::size_of::<f32>();
        Self {
            cells: vec![0.0; len].into_boxed_slice(),
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cells.len() * std::mem::size_of::<f32>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorInfo {
    pub dims: [usize; 2],
    pub element_type: &'static str,
}

pub trait InferenceEngine {
    fn input_tensor(&mut self) -> Result<&mut [f32], InferenceError>;
    fn invoke(&mut self) -> Result<(), InferenceError>;
    fn output_tensor(&self) -> Result<&[f32], InferenceError>;
}

#[derive(Debug)]
pub struct Interpreter {
    model: ModelSpec,
    arena: TensorArena,
    // tensors[0] is the input, tensors[i + 1] the output of layer i.
    tensors: Option<Vec<Range<usize>>>,
}

impl Interpreter {
    pub fn load(model_bytes: &[u8], arena: TensorArena) -> Result<Self, InferenceError> {
        let model = ModelSpec::from_bytes(model_bytes)?;
        Ok(Self {
            model,
            arena,
            tensors: None,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model.name
    }

    pub fn is_allocated(&self) -> bool {
        self.tensors.is_some()
    }

    pub fn allocate_tensors(&mut self) -> Result<(), InferenceError> {
        let widths = std::iter::once(self.model.inputs)
            .chain(self.model.layers.iter().map(DenseLayer::output_width));

        let mut tensors = Vec::with_capacity(self.model.layers.len() + 1);
        let mut offset = 0;
        for width in widths {
            tensors.push(offset..offset + width);
            offset += width;
        }

        let required = offset * std::mem::size_of::<f32>();
        let available = self.arena.capacity_bytes();
        if required > available {
            return Err(InferenceError::AllocationFailed {
                required,
                available,
            });
        }

        self.arena.cells[..offset].fill(0.0);
        self.tensors = Some(tensors);
        Ok(())
    }

    pub fn input_info(&self) -> Option<TensorInfo> {
        self.tensors.as_ref()?;
        Some(TensorInfo {
            dims: [1, self.model.inputs],
            element_type: "float32",
        })
    }

    pub fn output_info(&self) -> Option<TensorInfo> {
        self.tensors.as_ref()?;
        Some(TensorInfo {
            dims: [1, self.model.outputs],
            element_type: "float32",
        })
    }

    fn tensors(&self) -> Result<&[Range<usize>], InferenceError> {
        self.tensors.as_deref().ok_or(InferenceError::NotAllocated)
    }
}

impl InferenceEngine for Interpreter {
    fn input_tensor(&mut self) -> Result<&mut [f32], InferenceError> {
        let range = self.tensors()?[0].clone();
        Ok(&mut self.arena.cells[range])
    }

    fn invoke(&mut self) -> Result<(), InferenceError> {
        let tensors = self.tensors.as_ref().ok_or(InferenceError::NotAllocated)?;

        for (index, layer) in self.model.layers.iter().enumerate() {
            let src = tensors[index].clone();
            let dst = tensors[index + 1].clone();

            // Activations are laid out in layer order, so the source always
            // sits below the destination.
            let (head, tail) = self.arena.cells.split_at_mut(dst.start);
            let input = &head[src];
            let output = &mut tail[..dst.len()];

            for ((out, row), bias) in output.iter_mut().zip(&layer.weights).zip(&layer.bias) {
                *out = bias + row.iter().zip(input).map(|(w, x)| w * x).sum::<f32>();
            }
            // Checked before the activation too: relu would mask a NaN.
            if output.iter().any(|value| !value.is_finite()) {
                return Err(InferenceError::InvokeFailed(format!(
                    "layer {index} produced a non-finite value"
                )));
            }

            apply_activation(layer.activation, output);
            if output.iter().any(|value| !value.is_finite()) {
                return Err(InferenceError::InvokeFailed(format!(
                    "layer {index} activation overflowed"
                )));
            }
        }
        Ok(())
    }

    fn output_tensor(&self) -> Result<&[f32], InferenceError> {
        let range = self.tensors()?.last().cloned().ok_or(InferenceError::NotAllocated)?;
        Ok(&self.arena.cells[range])
    }
}

fn apply_activation(activation: Activation, values: &mut [f32]) {
    match activation {
        Activation::Linear => {}
        Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
        Activation::Sigmoid => values.iter_mut().for_each(|v| *v = 1.0 / (1.0 + (-*v).exp())),
        Activation::Softmax => {
            let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for v in values.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            values.iter_mut().for_each(|v| *v /= sum);
        }
    }
}

pub fn init_engine(model_bytes: &[u8], arena_bytes: usize) -> Result<Interpreter, InferenceError> {
    let mut interpreter = Interpreter::load(model_bytes, TensorArena::with_bytes(arena_bytes))?;
    interpreter.allocate_tensors()?;

    if let (Some(input), Some(output)) = (interpreter.input_info(), interpreter.output_info()) {
        debug!(
            "model `{}` ready: input dims {:?} ({}), output dims {:?} ({})",
            interpreter.model_name(),
            input.dims,
            input.element_type,
            output.dims,
            output.element_type
        );
    }
    Ok(interpreter)
}

#[cfg(test)]
mod tests {

    use super::*;

    fn model_with_version(version: u32) -> String {
        String::from_utf8(EMBEDDED_MODEL.to_vec())
            .unwrap()
            .replacen("\"schema_version\": 3", &format!("\"schema_version\": {version}"), 1)
    }

    fn run(engine: &mut Interpreter, temp: f32, humidity: f32) -> Vec<f32> {
        let input = engine.input_tensor().unwrap();
        input[0] = temp;
        input[1] = humidity;
        engine.invoke().unwrap();
        engine.output_tensor().unwrap().to_vec()
    }

    #[test]
    fn embedded_model_loads_and_allocates() {
        let engine = init_engine(EMBEDDED_MODEL, 12 * 1024).unwrap();
        assert!(engine.is_allocated());
        assert_eq!(engine.input_info().unwrap().dims, [1, 2]);
        assert_eq!(engine.output_info().unwrap().dims, [1, 4]);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let bytes = model_with_version(4);
        let err = Interpreter::load(bytes.as_bytes(), TensorArena::with_bytes(1024)).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::VersionMismatch {
                model: 4,
                supported: 3
            }
        ));
    }

    #[test]
    fn arena_too_small_fails_allocation() {
        let mut engine = Interpreter::load(EMBEDDED_MODEL, TensorArena::with_bytes(32)).unwrap();
        let err = engine.allocate_tensors().unwrap_err();
        assert!(matches!(
            err,
            InferenceError::AllocationFailed {
                required: 44,
                available: 32
            }
        ));
        assert!(!engine.is_allocated());
    }

    #[test]
    fn unallocated_engine_refuses_to_run() {
        let mut engine = Interpreter::load(EMBEDDED_MODEL, TensorArena::with_bytes(1024)).unwrap();
        assert!(matches!(engine.input_tensor(), Err(InferenceError::NotAllocated)));
        assert!(matches!(engine.invoke(), Err(InferenceError::NotAllocated)));
        assert!(matches!(engine.output_tensor(), Err(InferenceError::NotAllocated)));
    }

    #[test]
    fn repeated_invocation_is_deterministic() {
        let mut engine = init_engine(EMBEDDED_MODEL, 12 * 1024).unwrap();
        let first = run(&mut engine, 25.0, 60.0);
        let second = run(&mut engine, 25.0, 60.0);
        assert_eq!(first, second);

        let total: f32 = first.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn non_finite_input_fails_invoke() {
        let mut engine = init_engine(EMBEDDED_MODEL, 12 * 1024).unwrap();
        let input = engine.input_tensor().unwrap();
        input[0] = f32::NAN;
        input[1] = 50.0;
        assert!(matches!(engine.invoke(), Err(InferenceError::InvokeFailed(_))));
    }

    #[test]
    fn wrong_boundary_is_invalid() {
        let bytes = String::from_utf8(EMBEDDED_MODEL.to_vec())
            .unwrap()
            .replacen("\"outputs\": 4", "\"outputs\": 3", 1);
        let err = Interpreter::load(bytes.as_bytes(), TensorArena::with_bytes(1024)).unwrap_err();
        assert!(matches!(err, InferenceError::InvalidModel(_)));
    }
}
