use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};

/// Build an ONNX Runtime session with the configured thread caps.
/// Sessions are created once at pipeline construction and reused for
/// every frame.
pub(crate) fn build_session(
    model_path: &str,
    intra_threads: usize,
    inter_threads: usize,
) -> Result<Session> {
    let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if intra_threads > 0 {
        builder = builder.with_intra_threads(intra_threads)?;
    }
    if inter_threads > 0 {
        builder = builder.with_inter_threads(inter_threads)?;
    }
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("load model {model_path}"))
}
