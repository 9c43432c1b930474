//! Gender/age estimation (InsightFace genderage): 96x96 face crop in,
//! `[female_logit, male_logit, age_normalized]` out.

use anyhow::{bail, Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;
use std::sync::Mutex;

use crate::onnx::build_session;

const OUTPUT_NAME: &str = "fc1";

#[derive(Debug, Clone, PartialEq)]
pub struct FaceAttributes {
    /// "male" or "female"
    pub gender: String,
    /// Softmax probability of the chosen class.
    pub gender_confidence: f32,
    pub age: i32,
    /// Coarse 5-year bucket around the rounded age, e.g. "30-35".
    pub age_range: String,
}

pub struct AttributePredictor {
    session: Mutex<ort::session::Session>,
    input_w: u32,
    input_h: u32,
}

impl AttributePredictor {
    pub fn new(model_path: &str, intra_threads: usize, inter_threads: usize) -> Result<Self> {
        let session = build_session(model_path, intra_threads, inter_threads)
            .context("create attribute session")?;
        Ok(Self {
            session: Mutex::new(session),
            input_w: 96,
            input_h: 96,
        })
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.input_w, self.input_h)
    }

    /// Predict gender and age from a preprocessed CHW crop ([3, 96, 96]).
    pub fn predict(&self, input: Vec<f32>) -> Result<FaceAttributes> {
        let shape = [1usize, 3, self.input_h as usize, self.input_w as usize];
        let array = Array::from_shape_vec(IxDyn(&shape), input).context("shape attribute input")?;
        let tensor = Value::from_array(array)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("lock attribute session: {e}"))?;
        let outputs = session.run(ort::inputs![tensor])?;

        let (_, data) = outputs
            .get(OUTPUT_NAME)
            .with_context(|| format!("missing output {OUTPUT_NAME}"))?
            .try_extract_tensor::<f32>()?;
        interpret_output(data)
    }
}

/// fc1 is the concatenation of the 2-class gender head and the single
/// normalised-age head. Age was trained as age/100.
pub(crate) fn interpret_output(data: &[f32]) -> Result<FaceAttributes> {
    if data.len() < 3 {
        bail!("unexpected attribute output size: {}", data.len());
    }

    let female_logit = data[0];
    let male_logit = data[1];
    let age_norm = data[2];

    let gender = if male_logit > female_logit {
        "male"
    } else {
        "female"
    };

    // softmax(male) over two classes
    let male_probability = (1.0 / (1.0 + f64::from(-(male_logit - female_logit)).exp())) as f32;
    let gender_confidence = if gender == "male" {
        male_probability
    } else {
        1.0 - male_probability
    };

    let age = ((age_norm as f64 * 100.0).round() as i32).clamp(0, 100);
    let lower = (age / 5) * 5;
    let age_range = format!("{}-{}", lower, lower + 5);

    Ok(FaceAttributes {
        gender: gender.to_string(),
        gender_confidence,
        age,
        age_range,
    })
}
