use faer::{Mat, MatRef};
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Copies a faer matrix into an owned ndarray matrix.
pub fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

/// A faer view of an ndarray matrix. Contiguous arrays in either memory order are
/// borrowed; anything else is copied once.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let borrowed = array.as_slice_memory_order().and_then(|slice| {
            if array.is_standard_layout() {
                Some(MatRef::from_row_major_slice(slice, rows, cols))
            } else if array.t().is_standard_layout() {
                Some(MatRef::from_column_major_slice(slice, rows, cols))
            } else {
                None
            }
        });
        let storage = match borrowed {
            Some(view) => FaerStorage::Borrowed(view),
            None => FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        match &self.storage {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ShapeBuilder, array, s};

    #[test]
    fn views_match_every_layout() {
        let row_major = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let col_major = {
            let mut a = Array2::<f64>::zeros((2, 3).f());
            a.assign(&row_major);
            a
        };
        let strided = {
            let wide = array![[1.0, 0.0, 2.0, 0.0, 3.0], [4.0, 0.0, 5.0, 0.0, 6.0]];
            wide.slice(s![.., ..;2]).to_owned()
        };
        for source in [&row_major, &col_major, &strided] {
            let view = FaerArrayView::new(source);
            assert_eq!(mat_to_array(view.as_ref()), row_major);
        }

        let wide = array![[1.0, 0.0, 2.0, 0.0, 3.0], [4.0, 0.0, 5.0, 0.0, 6.0]];
        let sliced = wide.slice(s![.., ..;2]);
        let view = FaerArrayView::new(&sliced);
        assert_eq!(mat_to_array(view.as_ref()), row_major);
    }
}
