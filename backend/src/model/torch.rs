use log::{debug, info};
use shared::TaskKind;
use std::sync::Mutex;
use tch::{CModule, Device, Kind, TchError, Tensor};

use super::artifact::{
    ArtifactSpec, LoadError, ModelBackend, ModelHandle, PredictError, Prediction, is_out_of_memory,
};
use crate::config::{DeviceKind, RuntimeConfig};
use crate::inference::DecodedImage;

/// Loads TorchScript exports of the classifiers.
pub struct TorchBackend {
    device: Device,
}

impl TorchBackend {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        tch::set_num_threads(runtime.num_threads as i32);
        let device = match runtime.device {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::CudaIfAvailable => Device::cuda_if_available(),
        };
        info!(
            "Torch backend on {:?} with {} intra-op thread(s)",
            device, runtime.num_threads
        );
        Self { device }
    }

    fn synchronize(&self) {
        if let Device::Cuda(index) = self.device {
            tch::Cuda::synchronize(index as i64);
        }
    }
}

impl ModelBackend for TorchBackend {
    fn load(&self, task: TaskKind, spec: &ArtifactSpec) -> Result<Box<dyn ModelHandle>, LoadError> {
        if !spec.path.is_file() {
            return Err(LoadError::NotFound(spec.path.clone()));
        }
        let mut module = CModule::load_on_device(&spec.path, self.device).map_err(|e| {
            let reason = e.to_string();
            if is_out_of_memory(&reason) {
                LoadError::ResourceExhausted
            } else {
                LoadError::Invalid {
                    path: spec.path.clone(),
                    reason,
                }
            }
        })?;
        module.set_eval();
        debug!("TorchScript module for '{}' loaded in eval mode", task);

        Ok(Box::new(TorchModel {
            module: Mutex::new(module),
            labels: spec.labels.clone(),
            device: self.device,
        }))
    }

    fn reclaim(&self) {
        self.synchronize();
        debug!("Reclaimed memory after eviction");
    }

    fn clear_transient(&self) {
        self.synchronize();
    }
}

pub struct TorchModel {
    module: Mutex<CModule>,
    labels: Vec<String>,
    device: Device,
}

impl TorchModel {
    fn forward(&self, input: &DecodedImage) -> Result<Vec<f32>, TchError> {
        let data = input
            .as_slice()
            .ok_or_else(|| TchError::Shape("input tensor is not contiguous".to_string()))?;
        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let tensor = Tensor::from_slice(data)
            .f_view(shape.as_slice())?
            .f_to_device(self.device)?;

        let module = self
            .module
            .lock()
            .map_err(|_| TchError::Torch("model lock poisoned".to_string()))?;
        let output = tch::no_grad(|| module.forward_ts(&[tensor]))?;
        drop(module);

        let output = output.f_softmax(-1, Kind::Float)?;
        let output_flat = output.f_to_device(Device::Cpu)?.f_view([-1])?;
        let num_elements = output_flat.size()[0] as usize;
        let mut output_vec = vec![0.0f32; num_elements];
        output_flat.f_copy_data(&mut output_vec, num_elements)?;
        Ok(output_vec)
    }
}

impl ModelHandle for TorchModel {
    fn predict(&self, input: &DecodedImage) -> Result<Prediction, PredictError> {
        let probabilities = self.forward(input).map_err(|e| {
            let message = e.to_string();
            if is_out_of_memory(&message) {
                PredictError::ResourceExhausted
            } else {
                PredictError::Backend(message)
            }
        })?;
        Prediction::from_probabilities(&self.labels, probabilities)
    }
}
