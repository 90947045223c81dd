use candle_core::{DType, Device};

use super::{ElementKind, Tensor};
use crate::error::TensorError;

fn backend(err: candle_core::Error) -> TensorError {
    TensorError::Backend(err.to_string())
}

impl TryFrom<&Tensor> for candle_core::Tensor {
    type Error = TensorError;

    /// Copies onto the CPU device. `int32` widens to `i64`; `int8` has no
    /// candle counterpart.
    fn try_from(tensor: &Tensor) -> Result<Self, Self::Error> {
        let dims = tensor.dims();
        match tensor.kind() {
            ElementKind::Float32 => {
                candle_core::Tensor::from_vec(tensor.to_vec::<f32>()?, dims, &Device::Cpu).map_err(backend)
            }
            ElementKind::Uint32 => {
                candle_core::Tensor::from_vec(tensor.to_vec::<u32>()?, dims, &Device::Cpu).map_err(backend)
            }
            ElementKind::Uint8 => {
                candle_core::Tensor::from_vec(tensor.to_vec::<u8>()?, dims, &Device::Cpu).map_err(backend)
            }
            ElementKind::Int32 => {
                let wide: Vec<i64> = tensor.to_vec::<i32>()?.into_iter().map(i64::from).collect();
                candle_core::Tensor::from_vec(wide, dims, &Device::Cpu).map_err(backend)
            }
            ElementKind::Int8 => Err(TensorError::Backend("candle has no int8 dtype".into())),
        }
    }
}

impl TryFrom<&candle_core::Tensor> for Tensor {
    type Error = TensorError;

    fn try_from(tensor: &candle_core::Tensor) -> Result<Self, Self::Error> {
        let shape = tensor
            .dims()
            .iter()
            .map(|&d| u32::try_from(d).map_err(|_| TensorError::Backend(format!("dimension {d} exceeds u32"))))
            .collect::<Result<Vec<_>, _>>()?;
        let flat = tensor.flatten_all().map_err(backend)?;
        match tensor.dtype() {
            DType::F32 => Tensor::from_slice(&shape, &flat.to_vec1::<f32>().map_err(backend)?),
            DType::U32 => Tensor::from_slice(&shape, &flat.to_vec1::<u32>().map_err(backend)?),
            DType::U8 => Tensor::from_slice(&shape, &flat.to_vec1::<u8>().map_err(backend)?),
            DType::I64 => {
                let narrow = flat
                    .to_vec1::<i64>()
                    .map_err(backend)?
                    .into_iter()
                    .map(|v| i32::try_from(v).map_err(|_| TensorError::Backend(format!("value {v} exceeds int32"))))
                    .collect::<Result<Vec<_>, _>>()?;
                Tensor::from_slice(&shape, &narrow)
            }
            other => Err(TensorError::Backend(format!("unsupported candle dtype {other:?}"))),
        }
    }
}
