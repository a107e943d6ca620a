//! Burn tensor collation for sampled pairs.

use crate::sampler::{TilePair, TileSampler};
use crate::types::DatasetResult;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

pub struct SegBatch<B: Backend> {
    /// `[batch, bands, size, size]`, normalized.
    pub inputs: Tensor<B, 4>,
    /// `[batch, size, size]` class indices.
    pub labels: Tensor<B, 3, Int>,
}

/// Stack pairs into one batch; `None` for an empty slice. Pairs from one
/// sampler always share their shape.
pub fn collate_pairs<B: Backend>(pairs: &[TilePair], device: &B::Device) -> Option<SegBatch<B>> {
    let first = pairs.first()?;
    let [bands, h, w] = first.input.shape();
    let batch = pairs.len();

    let mut input_buf = Vec::with_capacity(batch * bands * h * w);
    let mut label_buf = Vec::with_capacity(batch * h * w);
    for pair in pairs {
        input_buf.extend_from_slice(&pair.input.data);
        label_buf.extend(pair.label.data.iter().map(|&v| i64::from(v)));
    }

    let inputs = Tensor::<B, 4>::from_data(TensorData::new(input_buf, [batch, bands, h, w]), device);
    let labels =
        Tensor::<B, 3, Int>::from_data(TensorData::new(label_buf, [batch, h, w]), device);
    Some(SegBatch { inputs, labels })
}

impl TileSampler {
    /// [`TileSampler::next_batch`] collated into burn tensors.
    pub fn next_seg_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<SegBatch<B>>> {
        Ok(self
            .next_batch(batch_size)?
            .and_then(|pairs| collate_pairs::<B>(&pairs, device)))
    }
}
