//! Checks for computed R factors.

use crate::kernel::r_factor;
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// `‖RᵀR − AᵀA‖_F / ‖AᵀA‖_F`. Returns the absolute error when AᵀA is zero.
pub fn gram_residual<S1, S2>(r: &ArrayBase<S1, Ix2>, a: &ArrayBase<S2, Ix2>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let rtr = r.t().dot(r);
    let ata = a.t().dot(a);
    let diff = (&rtr - &ata).mapv(|v| v * v).sum().sqrt();
    let scale = ata.mapv(|v| v * v).sum().sqrt();
    if scale > 0.0 { diff / scale } else { diff }
}

/// Flips rows so that every diagonal entry is non-negative.
pub fn normalize_row_signs<S: Data<Elem = f64>>(r: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let mut out = r.to_owned();
    let diag = out.nrows().min(out.ncols());
    for (i, mut row) in out.rows_mut().into_iter().enumerate().take(diag) {
        if row[i] < 0.0 {
            row.mapv_inplace(|v| -v);
        }
    }
    out
}

/// Largest entrywise difference after sign normalization. Infinite on a shape mismatch.
pub fn max_difference_up_to_sign<S1, S2>(r1: &ArrayBase<S1, Ix2>, r2: &ArrayBase<S2, Ix2>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    if r1.dim() != r2.dim() {
        return f64::INFINITY;
    }
    let a = normalize_row_signs(r1);
    let b = normalize_row_signs(r2);
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// R from one direct QR of the whole of `a`.
pub fn reference_r<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    r_factor(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn signs_follow_the_diagonal() {
        let r = array![[-1.0, 2.0], [0.0, 3.0]];
        assert_eq!(normalize_row_signs(&r), array![[1.0, -2.0], [0.0, 3.0]]);
        let flipped = array![[1.0, -2.0], [0.0, -3.0]];
        assert_eq!(max_difference_up_to_sign(&r, &flipped), 0.0);
        assert_eq!(max_difference_up_to_sign(&r, &array![[1.0]]), f64::INFINITY);
    }

    #[test]
    fn residual_of_the_reference_is_tiny() {
        let a = array![[1.0, 1.0], [1.0, -1.0], [2.0, 0.5]];
        assert!(gram_residual(&reference_r(&a), &a) < 1e-14);
        assert!(gram_residual(&Array2::<f64>::eye(2), &a) > 0.1);
    }
}
