use num_traits::Float;
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Element types understood by the convolution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub enum DataType {
    Float,
    Double,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float => 4,
            DataType::Double => 8,
        }
    }
}

/// Scalar type a backend convolution can run on
pub trait ConvElement: Float + bytemuck::Pod + Default + Debug + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

impl ConvElement for f32 {
    const DATA_TYPE: DataType = DataType::Float;
}

impl ConvElement for f64 {
    const DATA_TYPE: DataType = DataType::Double;
}

/// Resolve the backend data type of `T`
pub fn dtype_of<T: ConvElement>() -> DataType {
    T::DATA_TYPE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_inference() {
        assert_eq!(dtype_of::<f32>(), DataType::Float);
        assert_eq!(dtype_of::<f64>(), DataType::Double);
        assert_eq!(DataType::Double.size_in_bytes(), std::mem::size_of::<f64>());
    }
}
