// ========================================================================================
//                                  Schedule Driver
// ========================================================================================
//
// Turns a job into a chain of stages: stage i reads what stage i-1 wrote, fans in to
// r_i reducers, and the last stage (r_s = 1) writes the final R. Only the first reduce
// stage compresses on the map side; later stages forward partial Rs to their reducers
// unchanged. An optional spread stage runs first and only scatters the input rows.

use crate::config::JobConfig;
use crate::progress::{StageLabel, StageProgressObserver};
use crate::schedule::{
    ReduceSchedule, ScheduleError, default_output_path, intermediate_output_path,
};
use crate::stage::{MapperKind, ReducerKind, StageError, StageReport, StageSettings};
use crate::types::{BlockFactor, KeyPolicy};
use log::info;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid reduce schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
    #[error("output '{0}' would overwrite the input")]
    OutputIsInput(PathBuf),
    #[error("stage {stage} of {total} failed: {source}")]
    Stage {
        stage: usize,
        total: usize,
        source: StageError,
    },
}

/// Everything needed to compute R for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsqrJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub schedule: ReduceSchedule,
    pub block_factor: BlockFactor,
    pub split_size: Option<u64>,
    pub mem_hint: Option<u64>,
    pub key_policy: KeyPolicy,
    pub seed: Option<u64>,
}

impl TsqrJob {
    /// A single-stage job writing next to the input.
    pub fn new(input: impl Into<PathBuf>) -> Self {
        let input = input.into();
        Self {
            output: default_output_path(&input),
            input,
            schedule: ReduceSchedule::default(),
            block_factor: BlockFactor::default(),
            split_size: None,
            mem_hint: None,
            key_policy: KeyPolicy::default(),
            seed: None,
        }
    }

    pub fn from_config(
        input: impl Into<PathBuf>,
        output: Option<PathBuf>,
        config: &JobConfig,
    ) -> Result<Self, DriverError> {
        let mut job = Self::new(input);
        if let Some(output) = output {
            job.output = output;
        }
        if let Some(schedule) = &config.reduce_schedule {
            job.schedule = ReduceSchedule::parse(schedule)?;
        }
        if let Some(block_factor) = config.block_size {
            job.block_factor = block_factor;
        }
        job.split_size = config.split_size;
        job.mem_hint = config.mem;
        job.key_policy = config.key_policy.unwrap_or_default();
        job.seed = config.seed;
        Ok(job)
    }

    /// One plan per schedule entry, in execution order.
    pub fn plan(&self) -> Vec<StagePlan> {
        let total = self.schedule.stages();
        let spread = self
            .schedule
            .spread()
            .map(|parts| (parts, MapperKind::Identity, ReducerKind::Identity));
        let reduce = self
            .schedule
            .fan_ins()
            .iter()
            .enumerate()
            .map(|(i, &fan_in)| {
                let mapper = if i == 0 {
                    MapperKind::Compressing
                } else {
                    MapperKind::Identity
                };
                (fan_in, mapper, ReducerKind::Compressing)
            });
        let stages: Vec<(NonZeroUsize, MapperKind, ReducerKind)> =
            spread.into_iter().chain(reduce).collect();

        let mut source = self.input.clone();
        let mut plans = Vec::with_capacity(total);
        for (i, (fan_in, mapper, reducer)) in stages.into_iter().enumerate() {
            let index = i + 1;
            let output = if index == total {
                self.output.clone()
            } else {
                intermediate_output_path(&self.output, index)
            };
            plans.push(StagePlan {
                settings: StageSettings {
                    label: StageLabel { index, total },
                    fan_in,
                    mapper,
                    reducer,
                    block_factor: self.block_factor,
                    key_policy: self.key_policy,
                    seed: self.seed,
                    mem_hint: self.mem_hint,
                },
                input: source,
                output: output.clone(),
                split_size: self.split_size,
            });
            source = output;
        }
        plans
    }
}

// The absolute location `path` names, resolving `.`, `..` and links as far as the
// filesystem allows. A path that does not exist yet is resolved through its parent.
fn resolved_location(path: &Path) -> PathBuf {
    if let Ok(location) = fs::canonicalize(path) {
        return location;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            fs::canonicalize(parent)
                .map(|location| location.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Where one stage reads and writes, and how it runs.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub settings: StageSettings,
    pub input: PathBuf,
    pub output: PathBuf,
    pub split_size: Option<u64>,
}

/// The execution substrate seen by the driver.
pub trait StageRunner {
    /// Removes a previous output at `path`, if any.
    fn clear_output(&self, path: &Path) -> Result<(), StageError>;

    /// Runs one stage to completion.
    fn run_stage(
        &self,
        plan: &StagePlan,
        observer: &dyn StageProgressObserver,
    ) -> Result<StageReport, StageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub output: PathBuf,
    pub stages: Vec<StageReport>,
}

impl JobReport {
    pub fn compressions(&self) -> u64 {
        self.stages.iter().map(StageReport::compressions).sum()
    }
}

/// Runs every stage of `job` in order. The first failure stops the job.
pub fn run_job<R: StageRunner + ?Sized>(
    job: &TsqrJob,
    runner: &R,
    observer: &dyn StageProgressObserver,
) -> Result<JobReport, DriverError> {
    let plans = job.plan();
    let input = resolved_location(&job.input);
    if plans
        .iter()
        .any(|plan| plan.output == job.input || resolved_location(&plan.output) == input)
    {
        return Err(DriverError::OutputIsInput(job.input.clone()));
    }

    info!(
        "computing R of '{}' with schedule {} and block factor {}",
        job.input.display(),
        job.schedule,
        job.block_factor
    );
    let mut stages = Vec::with_capacity(plans.len());
    for plan in &plans {
        let label = plan.settings.label;
        let failed = |source| DriverError::Stage {
            stage: label.index,
            total: label.total,
            source,
        };
        info!(
            "{label}: '{}' -> '{}' with {} reducers",
            plan.input.display(),
            plan.output.display(),
            plan.settings.fan_in
        );
        runner.clear_output(&plan.output).map_err(failed)?;
        let report = runner.run_stage(plan, observer).map_err(failed)?;
        info!(
            "{label} done: {} rows read from {} partitions, {} rows shuffled, {} written by {} reducers, {} QR compressions",
            report.rows_read,
            report.map_tasks,
            report.rows_shuffled,
            report.rows_written,
            report.reducers_written,
            report.compressions()
        );
        stages.push(report);
    }
    info!("R written to '{}'", job.output.display());

    Ok(JobReport {
        output: job.output.clone(),
        stages,
    })
}
