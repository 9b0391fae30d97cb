//! Row-wise L2 normalization of embeddings.

use candle_core::Tensor;

use crate::error::Result;

/// Lower bound on a row norm before dividing, so zero rows stay zero.
pub const NORM_EPS: f64 = 1e-12;

/// Normalize every row of a `(rows, dim)` tensor to unit L2 norm.
///
/// # Errors
///
/// Returns an error if the tensor is not rank 2 or a tensor op fails.
pub fn l2_normalize_rows(xs: &Tensor) -> Result<Tensor> {
    xs.dims2()?;
    let norms = xs.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(NORM_EPS)?;
    Ok(xs.broadcast_div(&norms)?)
}

/// Normalize a host vector in place.
pub(crate) fn l2_normalize_slice(values: &mut [f64]) {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt().max(NORM_EPS);
    for v in values.iter_mut() {
        *v /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_rows_have_unit_norm() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[[3.0f32, 4.0], [1.0, 0.0], [-2.0, 2.0]], &device).unwrap();
        let normed = l2_normalize_rows(&xs).unwrap();
        let rows: Vec<Vec<f32>> = normed.to_vec2().unwrap();

        assert!((rows[0][0] - 0.6).abs() < 1e-6);
        assert!((rows[0][1] - 0.8).abs() < 1e-6);
        for row in rows {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_row_stays_finite() {
        let device = Device::Cpu;
        let xs = Tensor::zeros((2, 3), candle_core::DType::F32, &device).unwrap();
        let rows: Vec<Vec<f32>> = l2_normalize_rows(&xs).unwrap().to_vec2().unwrap();
        assert!(rows.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_rejects_vectors() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        assert!(l2_normalize_rows(&xs).is_err());
    }

    #[test]
    fn test_slice_normalization() {
        let mut v = vec![0.0, 5.0, 12.0];
        l2_normalize_slice(&mut v);
        assert!((v[1] - 5.0 / 13.0).abs() < 1e-12);
        assert!((v.iter().map(|x| x * x).sum::<f64>() - 1.0).abs() < 1e-12);
    }
}
