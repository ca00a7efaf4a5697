//! Local Householder QR. Only the R factor is ever consumed; the Householder
//! vectors faer leaves below the diagonal are discarded by the caller.

use crate::faer_ndarray::{FaerArrayView, mat_to_array};
use dyn_stack::{MemBuffer, MemStack};
use faer::linalg::qr::no_pivoting::factor::{qr_in_place, qr_in_place_scratch, recommended_blocksize};
use faer::{Mat, MatMut, Par};
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Reusable workspace for factoring blocks of up to `max_rows` rows and a fixed
/// number of columns without allocating per call.
pub struct QrKernel {
    householder: Mat<f64>,
    scratch: MemBuffer,
    max_rows: usize,
    ncols: usize,
}

impl QrKernel {
    pub fn new(max_rows: usize, ncols: usize) -> Self {
        let blocksize = recommended_blocksize::<f64>(max_rows, ncols);
        let scratch = MemBuffer::new(qr_in_place_scratch::<f64>(
            max_rows,
            ncols,
            blocksize,
            Par::Seq,
            Default::default(),
        ));
        Self {
            householder: Mat::zeros(blocksize, max_rows.min(ncols)),
            scratch,
            max_rows,
            ncols,
        }
    }

    /// Factors `block` in place. Afterwards the leading `min(rows, ncols)` rows hold
    /// R on and above the diagonal; entries below the diagonal are workspace.
    ///
    /// # Panics
    /// If `block` has a different column count or more rows than the kernel was
    /// sized for.
    pub fn factor_in_place(&mut self, block: MatMut<'_, f64>) {
        let (rows, cols) = (block.nrows(), block.ncols());
        assert_eq!(cols, self.ncols, "kernel column count mismatch");
        assert!(rows <= self.max_rows, "block exceeds kernel capacity");
        let size = rows.min(cols);
        if size == 0 {
            return;
        }
        let blocksize = recommended_blocksize::<f64>(rows, cols).min(self.householder.nrows());
        let coeffs = self.householder.as_mut().submatrix_mut(0, 0, blocksize, size);
        let stack = MemStack::new(&mut self.scratch);
        qr_in_place(block, coeffs, Par::Seq, stack, Default::default());
    }
}

/// The `ncols×ncols` upper-triangular R of `a`, padded with zero rows when `a`
/// has fewer rows than columns.
pub fn r_factor<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (rows, cols) = a.dim();
    let view = FaerArrayView::new(a);
    let source = view.as_ref();
    let mut work = Mat::<f64>::from_fn(rows, cols, |i, j| source[(i, j)]);
    let mut kernel = QrKernel::new(rows, cols);
    kernel.factor_in_place(work.as_mut());
    let size = rows.min(cols);
    let top = mat_to_array(work.as_ref().submatrix(0, 0, size, cols));
    Array2::from_shape_fn((cols, cols), |(i, j)| {
        if i <= j && i < size { top[(i, j)] } else { 0.0 }
    })
}
