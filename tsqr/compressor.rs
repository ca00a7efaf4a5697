// ========================================================================================
//                                  Block Compressor
// ========================================================================================
//
// Reduces an unbounded stream of n-wide rows to one n×n upper-triangular R while holding
// at most k·n rows. Every time the buffer fills, the leading rows are factored in place
// and the buffer is reseeded with R, so the next factorization sees the compressed
// history plus the newly absorbed rows. RᵀR equals AᵀA of everything absorbed so far.

use crate::faer_ndarray::mat_to_array;
use crate::kernel::QrKernel;
use crate::types::{BlockFactor, GROUP_KEY_BOUND, GroupKey};
use faer::Mat;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::convert::Infallible;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressError {
    #[error("row has {found} columns, but the matrix has {expected}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("the first row of the stream has no columns")]
    EmptyRow,
}

/// Receives the rows of a finalized R.
pub trait RowSink {
    type Error;

    fn emit(&mut self, key: GroupKey, row: &[f64]) -> Result<(), Self::Error>;
}

impl RowSink for Vec<(GroupKey, Vec<f64>)> {
    type Error = Infallible;

    fn emit(&mut self, key: GroupKey, row: &[f64]) -> Result<(), Self::Error> {
        self.push((key, row.to_vec()));
        Ok(())
    }
}

/// Draws the shuffle keys attached to emitted rows.
pub trait KeySource {
    fn next_key(&mut self) -> GroupKey;
}

/// Uniform keys in `[0, 2^31)`.
pub struct RandomKeys {
    rng: StdRng,
}

impl RandomKeys {
    /// Keys seeded from the operating system, so a retried task draws fresh keys.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl KeySource for RandomKeys {
    fn next_key(&mut self) -> GroupKey {
        GroupKey::new(self.rng.gen_range(0..GROUP_KEY_BOUND))
    }
}

/// A running counter starting at a task-specific offset.
pub struct RoundRobinKeys {
    next: u32,
}

impl RoundRobinKeys {
    pub fn starting_at(offset: u32) -> Self {
        Self {
            next: offset % GROUP_KEY_BOUND,
        }
    }
}

impl KeySource for RoundRobinKeys {
    fn next_key(&mut self) -> GroupKey {
        let key = GroupKey::new(self.next);
        self.next = (self.next + 1) % GROUP_KEY_BOUND;
        key
    }
}

/// Counters of one compressor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressorStats {
    pub rows_absorbed: u64,
    pub compressions: u64,
    pub rows_emitted: u64,
}

impl CompressorStats {
    pub fn merge(&mut self, other: &CompressorStats) {
        self.rows_absorbed += other.rows_absorbed;
        self.compressions += other.compressions;
        self.rows_emitted += other.rows_emitted;
    }
}

// Everything that can only be sized once the first row fixes n.
struct Workspace {
    // Column-major so the kernel can factor the leading rows in place.
    buffer: Mat<f64>,
    kernel: QrKernel,
    ncols: usize,
}

pub struct BlockCompressor<S, K> {
    block_factor: BlockFactor,
    workspace: Option<Workspace>,
    cursor: usize,
    sink: Option<S>,
    keys: K,
    stats: CompressorStats,
    mem_hint: Option<u64>,
}

impl<S: RowSink, K: KeySource> BlockCompressor<S, K> {
    pub fn new(block_factor: BlockFactor, keys: K) -> Self {
        Self {
            block_factor,
            workspace: None,
            cursor: 0,
            sink: None,
            keys,
            stats: CompressorStats::default(),
            mem_hint: None,
        }
    }

    /// Per-task memory hint in bytes; exceeding it only logs a warning.
    pub fn with_mem_hint(mut self, mem_hint: Option<u64>) -> Self {
        self.mem_hint = mem_hint;
        self
    }

    pub fn with_sink(mut self, sink: S) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn attach_sink(&mut self, sink: S) {
        self.sink = Some(sink);
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// The column count, once the first row has fixed it.
    pub fn ncols(&self) -> Option<usize> {
        self.workspace.as_ref().map(|ws| ws.ncols)
    }

    fn workspace_for(&mut self, width: usize) -> Result<&mut Workspace, CompressError> {
        if self.workspace.is_none() {
            if width == 0 {
                return Err(CompressError::EmptyRow);
            }
            let rows = self.block_factor.buffer_rows(width);
            log::debug!("matrix size: {width} columns, up to {rows} local rows");
            let bytes = self.block_factor.buffer_bytes(width);
            if let Some(hint) = self.mem_hint.filter(|&hint| bytes > hint) {
                log::warn!(
                    "block buffer needs {bytes} bytes for {width} columns with block factor {}, above the memory hint of {hint} bytes",
                    self.block_factor
                );
            }
            self.workspace = Some(Workspace {
                buffer: Mat::zeros(rows, width),
                kernel: QrKernel::new(rows, width),
                ncols: width,
            });
        }
        let ws = self.workspace.as_mut().ok_or(CompressError::EmptyRow)?;
        if ws.ncols != width {
            return Err(CompressError::ShapeMismatch {
                expected: ws.ncols,
                found: width,
            });
        }
        Ok(ws)
    }

    /// Appends `row` to the buffer, compressing when it is full.
    pub fn absorb(&mut self, row: &[f64]) -> Result<(), CompressError> {
        let cursor = self.cursor;
        let ws = self.workspace_for(row.len())?;
        for (j, &value) in row.iter().enumerate() {
            ws.buffer[(cursor, j)] = value;
        }
        let full = cursor + 1 == ws.buffer.nrows();
        self.cursor = cursor + 1;
        self.stats.rows_absorbed += 1;
        if full {
            self.compress();
        }
        Ok(())
    }

    /// Factors the absorbed rows and reseeds the buffer with R. Does nothing before the
    /// first row.
    pub fn compress(&mut self) {
        let Some(ws) = self.workspace.as_mut() else {
            return;
        };
        let n = ws.ncols;
        let rows = self.cursor;
        ws.kernel
            .factor_in_place(ws.buffer.as_mut().submatrix_mut(0, 0, rows, n));
        let rank_rows = rows.min(n);
        for j in 0..n {
            for i in 0..ws.buffer.nrows() {
                if i > j || i >= rank_rows {
                    ws.buffer[(i, j)] = 0.0;
                }
            }
        }
        self.cursor = n;
        self.stats.compressions += 1;
        log::debug!(
            "QR compression {} of {rows} rows x {n} columns",
            self.stats.compressions
        );
    }

    /// The current R, or `None` before the first row.
    pub fn current_r(&self) -> Option<Array2<f64>> {
        let ws = self.workspace.as_ref()?;
        let n = ws.ncols;
        let top = mat_to_array(ws.buffer.as_ref().submatrix(0, 0, n, n));
        Some(Array2::from_shape_fn((n, n), |(i, j)| {
            if i <= j { top[(i, j)] } else { 0.0 }
        }))
    }

    /// Compresses once more and emits the n rows of R, each with a fresh key. A
    /// compressor that never saw a row, or has no sink, emits nothing.
    pub fn finalize(mut self) -> Result<(Option<S>, CompressorStats), S::Error> {
        if self.sink.is_none() {
            return Ok((self.sink, self.stats));
        }
        self.compress();
        if let (Some(r), Some(sink)) = (self.current_r(), self.sink.as_mut()) {
            let mut values = Vec::with_capacity(r.ncols());
            for row in r.rows() {
                values.clear();
                values.extend(row.iter().copied());
                sink.emit(self.keys.next_key(), &values)?;
                self.stats.rows_emitted += 1;
            }
        }
        Ok((self.sink, self.stats))
    }
}
