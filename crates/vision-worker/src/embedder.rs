//! ArcFace embedding extraction (w600k_r50): 112x112 face crop in,
//! L2-normalised 512-dim vector out.

use anyhow::{bail, Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;
use std::sync::Mutex;

use crate::onnx::build_session;

pub const EMBEDDING_DIM: usize = 512;

const OUTPUT_NAME: &str = "683";

pub struct Embedder {
    session: Mutex<ort::session::Session>,
    input_w: u32,
    input_h: u32,
}

impl Embedder {
    pub fn new(model_path: &str, intra_threads: usize, inter_threads: usize) -> Result<Self> {
        let session = build_session(model_path, intra_threads, inter_threads)
            .context("create embedder session")?;
        Ok(Self {
            session: Mutex::new(session),
            input_w: 112,
            input_h: 112,
        })
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_w, self.input_h)
    }

    /// Extract an embedding from a preprocessed CHW crop ([3, 112, 112],
    /// normalised). The result is unit length.
    pub fn extract(&self, input: Vec<f32>) -> Result<Vec<f32>> {
        let shape = [1usize, 3, self.input_h as usize, self.input_w as usize];
        let array = Array::from_shape_vec(IxDyn(&shape), input).context("shape embedder input")?;
        let tensor = Value::from_array(array)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("lock embedder session: {e}"))?;
        let outputs = session.run(ort::inputs![tensor])?;

        let (_, data) = outputs
            .get(OUTPUT_NAME)
            .with_context(|| format!("missing output {OUTPUT_NAME}"))?
            .try_extract_tensor::<f32>()?;
        if data.len() < EMBEDDING_DIM {
            bail!("unexpected embedding size: {}", data.len());
        }

        let mut embedding = data[..EMBEDDING_DIM].to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

/// In-place L2 normalisation. Zero vectors are left untouched.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let sum: f64 = v.iter().map(|&x| x as f64 * x as f64).sum();
    let norm = sum.sqrt() as f32;
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(v: &[f32]) -> f64 {
        v.iter().map(|&x| x as f64 * x as f64).sum::<f64>().sqrt()
    }

    #[test]
    fn normalized_vector_is_unit_length() {
        let mut v: Vec<f32> = (1..=512).map(|i| i as f32 * 0.01).collect();
        l2_normalize(&mut v);
        let n = norm(&v);
        assert!((0.999..=1.001).contains(&n), "norm was {n}");
    }

    #[test]
    fn zero_vector_is_untouched() {
        let mut v = vec![0f32; 8];
        l2_normalize(&mut v);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn direction_is_preserved() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }
}
