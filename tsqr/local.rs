use crate::driver::{StagePlan, StageRunner};
use crate::files::{FileSource, PartDirectory, clear_output};
use crate::progress::StageProgressObserver;
use crate::stage::{StageError, StageReport, execute_stage};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::Path;

/// Runs stages on this machine: partitions are files on disk, tasks run on a rayon
/// pool, and the shuffle happens in memory.
#[derive(Default)]
pub struct LocalRunner {
    pool: Option<ThreadPool>,
}

impl LocalRunner {
    /// Uses rayon's global pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, StageError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tsqr-worker-{i}"))
            .build()?;
        Ok(Self { pool: Some(pool) })
    }
}

impl StageRunner for LocalRunner {
    fn clear_output(&self, path: &Path) -> Result<(), StageError> {
        clear_output(path)
    }

    fn run_stage(
        &self,
        plan: &StagePlan,
        observer: &dyn StageProgressObserver,
    ) -> Result<StageReport, StageError> {
        let source = FileSource::open(&plan.input, plan.split_size)?;
        let output = PartDirectory::create(&plan.output)?;
        let run = || execute_stage(&plan.settings, &source, &output, observer);
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}
