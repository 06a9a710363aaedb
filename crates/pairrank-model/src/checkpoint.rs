//! Head checkpoints as safetensors archives.
//!
//! An archive holds one ordered list of arrays, stored as `params.0`,
//! `params.1`, ... in the head's parameter declaration order. Only head
//! parameters are written: no extractor weights, no optimizer state.

use candle_core::{Device, Tensor, Var};
use pairrank_core::{RankerError, Result};
use std::collections::HashMap;
use std::path::Path;

/// Archive key of the `index`-th parameter.
pub fn param_key(index: usize) -> String {
    format!("params.{index}")
}

/// Write the current values of `vars` to `path`, creating parent directories.
pub fn save_params(vars: &[Var], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tensors: HashMap<String, Tensor> = vars
        .iter()
        .enumerate()
        .map(|(i, var)| (param_key(i), var.as_tensor().detach()))
        .collect();
    candle_core::safetensors::save(&tensors, path)?;
    tracing::debug!(path = %path.display(), params = vars.len(), "Saved head parameters");
    Ok(())
}

/// Restore `vars` in place from the archive at `path`.
///
/// Every entry is checked before any variable is written, so a failed load
/// leaves the parameters untouched.
///
/// # Errors
///
/// Returns [`RankerError::Io`] / [`RankerError::Tensor`] when the file cannot
/// be read, [`RankerError::Checkpoint`] when the entry count differs, and
/// [`RankerError::ShapeMismatch`] when any array has the wrong shape.
pub fn load_params(vars: &[Var], path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(RankerError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("checkpoint not found: {}", path.display()),
        )));
    }
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    if tensors.len() != vars.len() {
        return Err(RankerError::Checkpoint(format!(
            "{} holds {} parameter arrays, head has {}",
            path.display(),
            tensors.len(),
            vars.len()
        )));
    }

    let mut restored = Vec::with_capacity(vars.len());
    for (i, var) in vars.iter().enumerate() {
        let key = param_key(i);
        let tensor = tensors.remove(&key).ok_or_else(|| {
            RankerError::Checkpoint(format!("{} has no entry {key}", path.display()))
        })?;
        if tensor.dims() != var.dims() {
            return Err(RankerError::ShapeMismatch {
                what: key,
                expected: var.dims().to_vec(),
                found: tensor.dims().to_vec(),
            });
        }
        restored.push(tensor.to_dtype(var.dtype())?.to_device(var.device())?);
    }

    for (var, tensor) in vars.iter().zip(restored.iter()) {
        var.set(tensor)?;
    }
    tracing::debug!(path = %path.display(), params = vars.len(), "Loaded head parameters");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(w: &[f32], b: f32) -> Vec<Var> {
        let device = Device::Cpu;
        vec![
            Var::from_tensor(&Tensor::new(w, &device).unwrap().reshape((1, w.len())).unwrap())
                .unwrap(),
            Var::new(&[b], &device).unwrap(),
        ]
    }

    #[test]
    fn test_round_trip_is_bit_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("head.safetensors");
        let saved = vars(&[0.1, -0.25, 1e-8], 0.1);
        save_params(&saved, &path).unwrap();

        let fresh = vars(&[0.0, 0.0, 0.0], 0.0);
        load_params(&fresh, &path).unwrap();
        for (a, b) in saved.iter().zip(fresh.iter()) {
            assert_eq!(bits(a), bits(b));
        }
    }

    fn bits(var: &Var) -> Vec<u32> {
        let values: Vec<f32> = var.flatten_all().unwrap().to_vec1().unwrap();
        values.iter().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn test_shape_mismatch_fails_without_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.safetensors");
        save_params(&vars(&[1.0, 2.0, 3.0], 0.5), &path).unwrap();

        let target = vars(&[9.0, 9.0], 9.0);
        let err = load_params(&target, &path).unwrap_err();
        assert!(matches!(err, RankerError::ShapeMismatch { .. }), "{err}");
        assert_eq!(target[1].as_tensor().to_vec1::<f32>().unwrap(), vec![9.0]);
    }

    #[test]
    fn test_entry_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("head.safetensors");
        save_params(&vars(&[1.0], 0.5)[..1], &path).unwrap();
        let err = load_params(&vars(&[1.0], 0.5), &path).unwrap_err();
        assert!(matches!(err, RankerError::Checkpoint(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_params(&vars(&[1.0], 0.5), Path::new("/nonexistent/head.safetensors"))
            .unwrap_err();
        assert!(matches!(err, RankerError::Io(_)));
    }
}
