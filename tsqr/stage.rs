// ========================================================================================
//                                   Stage Executor
// ========================================================================================
//
// One pass of the tree reduction. Map tasks turn each partition into keyed rows, the
// rows are grouped by key modulo the fan-in, and every non-empty group is absorbed by a
// reducer-side compressor that writes the n rows of its R. Mapper and reducer share the
// same compressor; they differ only in where their rows come from.

use crate::codec::CodecError;
use crate::compressor::{
    BlockCompressor, CompressError, CompressorStats, KeySource, RandomKeys, RoundRobinKeys,
    RowSink,
};
use crate::progress::{StageLabel, StageProgressObserver, TaskPhase};
use crate::types::{BlockFactor, GroupKey, KeyPolicy, Record};
use rayon::prelude::*;
use std::convert::Infallible;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use thiserror::Error;

/// A map task logs its progress every this many rows.
pub const ROWS_PER_PROGRESS_LOG: u64 = 50_000;

/// How a stage's map tasks treat their partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    /// Compress the partition locally and emit the n rows of its R.
    Compressing,
    /// Forward every record under its own key. Used once rows are already partial Rs.
    Identity,
}

/// How a stage's reduce tasks treat the rows routed to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerKind {
    /// Compress the group and write the n rows of its R.
    Compressing,
    /// Write every row unchanged under a fresh key. Used to spread a few large inputs
    /// over many parts.
    Identity,
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Compress(#[from] CompressError),
    #[error("malformed record: {0}")]
    Decode(#[from] CodecError),
    #[error("failed to read '{path}': {source}")]
    Input { path: PathBuf, source: io::Error },
    #[error("failed to write '{path}': {source}")]
    Output { path: PathBuf, source: io::Error },
}

#[derive(Error, Debug)]
pub enum StageError {
    #[error("map task {partition} failed: {source}")]
    MapTask { partition: usize, source: TaskError },
    #[error("reduce task {reducer} failed: {source}")]
    ReduceTask { reducer: usize, source: TaskError },
    #[error("input '{0}' does not exist")]
    MissingInput(PathBuf),
    #[error("failed to prepare '{path}': {source}")]
    Prepare { path: PathBuf, source: io::Error },
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Sequential reader over the records of one partition.
pub trait RecordReader {
    fn next_record(&mut self) -> Result<Option<Record>, TaskError>;
}

/// The partitioned input of a stage.
pub trait PartitionSource: Sync {
    type Reader: RecordReader;

    fn partition_count(&self) -> usize;
    fn open(&self, partition: usize) -> Result<Self::Reader, TaskError>;
}

/// Creates the per-reducer writers of a stage.
pub trait OutputFactory: Sync {
    type Writer: RowSink<Error = TaskError>;

    fn create(&self, reducer: usize) -> Result<Self::Writer, TaskError>;
    fn finish(&self, writer: Self::Writer) -> Result<(), TaskError>;
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub label: StageLabel,
    pub fan_in: NonZeroUsize,
    pub mapper: MapperKind,
    pub reducer: ReducerKind,
    pub block_factor: BlockFactor,
    pub key_policy: KeyPolicy,
    pub seed: Option<u64>,
    pub mem_hint: Option<u64>,
}

/// Counters of one finished stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub label: StageLabel,
    pub fan_in: usize,
    pub map_tasks: usize,
    pub reducers_written: usize,
    pub rows_read: u64,
    pub rows_shuffled: u64,
    pub rows_written: u64,
    pub map_stats: CompressorStats,
    pub reduce_stats: CompressorStats,
}

impl StageReport {
    pub fn compressions(&self) -> u64 {
        self.map_stats.compressions + self.reduce_stats.compressions
    }
}

enum TaskKeys {
    Random(RandomKeys),
    RoundRobin(RoundRobinKeys),
}

impl TaskKeys {
    fn for_task(settings: &StageSettings, phase: TaskPhase, task: usize) -> Self {
        match settings.key_policy {
            KeyPolicy::Random => Self::Random(match settings.seed {
                Some(seed) => RandomKeys::seeded(mix_seed(seed, settings.label.index, phase, task)),
                None => RandomKeys::from_entropy(),
            }),
            KeyPolicy::RoundRobin => Self::RoundRobin(RoundRobinKeys::starting_at(task as u32)),
        }
    }
}

impl KeySource for TaskKeys {
    fn next_key(&mut self) -> GroupKey {
        match self {
            Self::Random(keys) => keys.next_key(),
            Self::RoundRobin(keys) => keys.next_key(),
        }
    }
}

// splitmix64 finalizer over the task coordinates.
fn mix_seed(seed: u64, stage: usize, phase: TaskPhase, task: usize) -> u64 {
    let phase_bit = match phase {
        TaskPhase::Map => 0u64,
        TaskPhase::Reduce => 1u64,
    };
    let mut z = seed
        ^ (stage as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ (((task as u64) << 1) | phase_bit).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Rows emitted by one map task, already split by destination reducer.
struct ShuffleBuffer {
    fan_in: NonZeroUsize,
    buckets: Vec<Vec<Vec<f64>>>,
}

impl ShuffleBuffer {
    fn new(fan_in: NonZeroUsize) -> Self {
        Self {
            fan_in,
            buckets: vec![Vec::new(); fan_in.get()],
        }
    }

    fn push(&mut self, reducer: usize, row: Vec<f64>) {
        self.buckets[reducer].push(row);
    }

    fn len(&self) -> u64 {
        self.buckets.iter().map(|b| b.len() as u64).sum()
    }
}

impl RowSink for ShuffleBuffer {
    type Error = Infallible;

    fn emit(&mut self, key: GroupKey, row: &[f64]) -> Result<(), Self::Error> {
        let reducer = key.reducer_index(self.fan_in);
        self.push(reducer, row.to_vec());
        Ok(())
    }
}

struct MapOutput {
    shuffle: ShuffleBuffer,
    rows_read: u64,
    stats: CompressorStats,
}

fn run_map_task<P: PartitionSource>(
    settings: &StageSettings,
    source: &P,
    partition: usize,
) -> Result<MapOutput, TaskError> {
    let mut reader = source.open(partition)?;
    let mut rows_read = 0u64;
    let log_progress = |rows: u64| {
        if rows % ROWS_PER_PROGRESS_LOG == 0 {
            log::debug!(
                "{} map task {partition}: {rows} rows processed",
                settings.label
            );
        }
    };

    match settings.mapper {
        MapperKind::Identity => {
            let mut shuffle = ShuffleBuffer::new(settings.fan_in);
            while let Some(record) = reader.next_record()? {
                let reducer = record.key.reducer_index(settings.fan_in);
                shuffle.push(reducer, record.row);
                rows_read += 1;
                log_progress(rows_read);
            }
            Ok(MapOutput {
                shuffle,
                rows_read,
                stats: CompressorStats::default(),
            })
        }
        MapperKind::Compressing => {
            let keys = TaskKeys::for_task(settings, TaskPhase::Map, partition);
            let mut compressor = BlockCompressor::new(settings.block_factor, keys)
                .with_mem_hint(settings.mem_hint)
                .with_sink(ShuffleBuffer::new(settings.fan_in));
            while let Some(record) = reader.next_record()? {
                compressor.absorb(&record.row)?;
                rows_read += 1;
                log_progress(rows_read);
            }
            if let Some(ncols) = compressor.ncols() {
                log::debug!(
                    "{} map task {partition}: {rows_read} rows of {ncols} columns",
                    settings.label
                );
            }
            let (sink, stats) = match compressor.finalize() {
                Ok(done) => done,
                Err(never) => match never {},
            };
            Ok(MapOutput {
                shuffle: sink.unwrap_or_else(|| ShuffleBuffer::new(settings.fan_in)),
                rows_read,
                stats,
            })
        }
    }
}

fn run_reduce_task<O: OutputFactory>(
    settings: &StageSettings,
    output: &O,
    reducer: usize,
    rows: Vec<Vec<f64>>,
) -> Result<(CompressorStats, bool), TaskError> {
    let mut keys = TaskKeys::for_task(settings, TaskPhase::Reduce, reducer);
    if settings.reducer == ReducerKind::Identity {
        if rows.is_empty() {
            return Ok((CompressorStats::default(), false));
        }
        let mut writer = output.create(reducer)?;
        for row in &rows {
            writer.emit(keys.next_key(), row)?;
        }
        output.finish(writer)?;
        let forwarded = rows.len() as u64;
        let stats = CompressorStats {
            rows_absorbed: forwarded,
            compressions: 0,
            rows_emitted: forwarded,
        };
        return Ok((stats, true));
    }

    let mut compressor: BlockCompressor<O::Writer, TaskKeys> =
        BlockCompressor::new(settings.block_factor, keys).with_mem_hint(settings.mem_hint);
    for row in &rows {
        if !compressor.has_sink() {
            compressor.attach_sink(output.create(reducer)?);
        }
        compressor.absorb(row)?;
    }
    let (writer, stats) = compressor.finalize()?;
    let wrote = match writer {
        Some(writer) => {
            output.finish(writer)?;
            true
        }
        None => false,
    };
    Ok((stats, wrote))
}

/// Runs one stage to completion on the current rayon pool.
pub fn execute_stage<P, O>(
    settings: &StageSettings,
    source: &P,
    output: &O,
    observer: &dyn StageProgressObserver,
) -> Result<StageReport, StageError>
where
    P: PartitionSource,
    O: OutputFactory,
{
    let label = settings.label;
    let partitions = source.partition_count();
    let fan_in = settings.fan_in.get();

    observer.on_phase_start(label, TaskPhase::Map, partitions);
    let map_outputs = (0..partitions)
        .into_par_iter()
        .map(|partition| {
            let result = run_map_task(settings, source, partition)
                .map_err(|source| StageError::MapTask { partition, source });
            observer.on_task_finish(label, TaskPhase::Map);
            result
        })
        .collect::<Result<Vec<_>, _>>()?;
    observer.on_phase_finish(label, TaskPhase::Map);

    let mut rows_read = 0u64;
    let mut rows_shuffled = 0u64;
    let mut map_stats = CompressorStats::default();
    let mut groups: Vec<Vec<Vec<f64>>> = vec![Vec::new(); fan_in];
    for out in map_outputs {
        rows_read += out.rows_read;
        rows_shuffled += out.shuffle.len();
        map_stats.merge(&out.stats);
        for (group, bucket) in groups.iter_mut().zip(out.shuffle.buckets) {
            group.extend(bucket);
        }
    }
    log::debug!("{label}: shuffled {rows_shuffled} rows to {fan_in} reducers");

    observer.on_phase_start(label, TaskPhase::Reduce, fan_in);
    let reduce_results = groups
        .into_par_iter()
        .enumerate()
        .map(|(reducer, rows)| {
            let result = run_reduce_task(settings, output, reducer, rows)
                .map_err(|source| StageError::ReduceTask { reducer, source });
            observer.on_task_finish(label, TaskPhase::Reduce);
            result
        })
        .collect::<Result<Vec<_>, _>>()?;
    observer.on_phase_finish(label, TaskPhase::Reduce);

    let mut reduce_stats = CompressorStats::default();
    let mut reducers_written = 0;
    for (stats, wrote) in &reduce_results {
        reduce_stats.merge(stats);
        if *wrote {
            reducers_written += 1;
        }
    }

    Ok(StageReport {
        label,
        fan_in,
        map_tasks: partitions,
        reducers_written,
        rows_read,
        rows_shuffled,
        rows_written: reduce_stats.rows_emitted,
        map_stats,
        reduce_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopStageProgress;
    use crate::types::RecordKey;
    use crate::verify::{gram_residual, max_difference_up_to_sign, reference_r};
    use ndarray::{Array2, s};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct MemorySource {
        partitions: Vec<Vec<Record>>,
    }

    struct MemoryReader {
        records: std::vec::IntoIter<Record>,
    }

    impl RecordReader for MemoryReader {
        fn next_record(&mut self) -> Result<Option<Record>, TaskError> {
            Ok(self.records.next())
        }
    }

    impl PartitionSource for MemorySource {
        type Reader = MemoryReader;

        fn partition_count(&self) -> usize {
            self.partitions.len()
        }

        fn open(&self, partition: usize) -> Result<MemoryReader, TaskError> {
            Ok(MemoryReader {
                records: self.partitions[partition].clone().into_iter(),
            })
        }
    }

    #[derive(Default)]
    struct MemoryOutput {
        parts: Mutex<BTreeMap<usize, Vec<Record>>>,
    }

    struct MemoryWriter {
        reducer: usize,
        records: Vec<Record>,
    }

    impl RowSink for MemoryWriter {
        type Error = TaskError;

        fn emit(&mut self, key: GroupKey, row: &[f64]) -> Result<(), TaskError> {
            self.records.push(Record {
                key: key.into(),
                row: row.to_vec(),
            });
            Ok(())
        }
    }

    impl OutputFactory for MemoryOutput {
        type Writer = MemoryWriter;

        fn create(&self, reducer: usize) -> Result<MemoryWriter, TaskError> {
            Ok(MemoryWriter {
                reducer,
                records: Vec::new(),
            })
        }

        fn finish(&self, writer: MemoryWriter) -> Result<(), TaskError> {
            self.parts
                .lock()
                .unwrap()
                .insert(writer.reducer, writer.records);
            Ok(())
        }
    }

    impl MemoryOutput {
        fn into_source(self) -> MemorySource {
            MemorySource {
                partitions: self.parts.into_inner().unwrap().into_values().collect(),
            }
        }
    }

    fn settings(index: usize, total: usize, fan_in: usize, mapper: MapperKind) -> StageSettings {
        StageSettings {
            label: StageLabel { index, total },
            fan_in: NonZeroUsize::new(fan_in).unwrap(),
            mapper,
            reducer: ReducerKind::Compressing,
            block_factor: BlockFactor::default(),
            key_policy: KeyPolicy::Random,
            seed: Some(99),
            mem_hint: None,
        }
    }

    fn partitioned(a: &Array2<f64>, parts: usize) -> MemorySource {
        let chunk = a.nrows().div_ceil(parts);
        let mut partitions = vec![Vec::new(); parts];
        for (i, row) in a.rows().into_iter().enumerate() {
            partitions[i / chunk].push(Record {
                key: RecordKey::Int(i as i64),
                row: row.to_vec(),
            });
        }
        MemorySource { partitions }
    }

    fn gaussian(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng))
    }

    fn collect_r(source: &MemorySource, n: usize) -> Array2<f64> {
        let rows: Vec<&Record> = source.partitions.iter().flatten().collect();
        assert_eq!(rows.len(), n);
        Array2::from_shape_fn((n, n), |(i, j)| rows[i].row[j])
    }

    #[test]
    fn two_stage_reduction_matches_direct_qr() {
        let a = gaussian(2000, 5, 4);
        let input = partitioned(&a, 8);

        let first = MemoryOutput::default();
        let report = execute_stage(
            &settings(1, 2, 3, MapperKind::Compressing),
            &input,
            &first,
            &NoopStageProgress,
        )
        .unwrap();
        assert_eq!(report.map_tasks, 8);
        assert_eq!(report.rows_read, 2000);
        assert_eq!(report.rows_shuffled, 8 * 5);
        assert_eq!(report.rows_written, 5 * report.reducers_written as u64);
        assert!(report.reducers_written >= 1 && report.reducers_written <= 3);

        let intermediate = first.into_source();
        let second = MemoryOutput::default();
        let report = execute_stage(
            &settings(2, 2, 1, MapperKind::Identity),
            &intermediate,
            &second,
            &NoopStageProgress,
        )
        .unwrap();
        assert_eq!(report.reducers_written, 1);
        assert_eq!(report.map_stats, CompressorStats::default());

        let r = collect_r(&second.into_source(), 5);
        assert!(gram_residual(&r, &a) < 1e-12);
        assert!(max_difference_up_to_sign(&r, &reference_r(&a)) < 1e-9);
    }

    #[test]
    fn empty_partitions_are_tolerated() {
        let a = gaussian(50, 3, 5);
        let mut input = partitioned(&a, 2);
        input.partitions.insert(1, Vec::new());
        input.partitions.push(Vec::new());

        let output = MemoryOutput::default();
        let report = execute_stage(
            &settings(1, 1, 1, MapperKind::Compressing),
            &input,
            &output,
            &NoopStageProgress,
        )
        .unwrap();
        assert_eq!(report.map_tasks, 4);
        assert_eq!(report.rows_shuffled, 2 * 3);
        let r = collect_r(&output.into_source(), 3);
        assert!(gram_residual(&r, &a) < 1e-12);
    }

    #[test]
    fn a_stage_without_rows_writes_nothing() {
        let input = MemorySource {
            partitions: vec![Vec::new(), Vec::new()],
        };
        let output = MemoryOutput::default();
        let report = execute_stage(
            &settings(1, 1, 4, MapperKind::Compressing),
            &input,
            &output,
            &NoopStageProgress,
        )
        .unwrap();
        assert_eq!(report.reducers_written, 0);
        assert!(output.parts.lock().unwrap().is_empty());
    }

    #[test]
    fn shape_mismatch_fails_the_map_task() {
        let mut partition: Vec<Record> = (0..4)
            .map(|i| Record {
                key: RecordKey::Int(i),
                row: vec![1.0 + i as f64; 5],
            })
            .collect();
        partition.push(Record {
            key: RecordKey::Int(4),
            row: vec![0.0; 6],
        });
        let input = MemorySource {
            partitions: vec![Vec::new(), partition],
        };
        let err = execute_stage(
            &settings(1, 1, 1, MapperKind::Compressing),
            &input,
            &MemoryOutput::default(),
            &NoopStageProgress,
        )
        .unwrap_err();
        match err {
            StageError::MapTask {
                partition: 1,
                source: TaskError::Compress(CompressError::ShapeMismatch { expected: 5, found: 6 }),
            } => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn round_robin_keys_give_the_same_r() {
        let a = gaussian(600, 4, 6);
        let mut round_robin = settings(1, 1, 1, MapperKind::Compressing);
        round_robin.key_policy = KeyPolicy::RoundRobin;
        round_robin.seed = None;
        let output = MemoryOutput::default();
        execute_stage(&round_robin, &partitioned(&a, 5), &output, &NoopStageProgress).unwrap();
        let r = collect_r(&output.into_source(), 4);
        assert!(max_difference_up_to_sign(&r, &reference_r(&a.slice(s![.., ..]))) < 1e-9);
    }

    #[test]
    fn identity_reducers_spread_rows_unchanged() {
        let a = gaussian(40, 3, 8);
        let mut spread = settings(1, 2, 4, MapperKind::Identity);
        spread.reducer = ReducerKind::Identity;
        let output = MemoryOutput::default();
        let report = execute_stage(&spread, &partitioned(&a, 1), &output, &NoopStageProgress).unwrap();
        assert_eq!(report.map_tasks, 1);
        assert_eq!(report.reducers_written, 4);
        assert_eq!(report.rows_written, 40);
        assert_eq!(report.compressions(), 0);

        let parts = output.into_source();
        assert_eq!(parts.partition_count(), 4);
        let mut rows: Vec<Vec<f64>> = parts
            .partitions
            .iter()
            .flatten()
            .map(|record| record.row.clone())
            .collect();
        assert_eq!(parts.partitions[0].len(), 10);
        rows.sort_by(|x, y| x[0].total_cmp(&y[0]));
        let mut expected: Vec<Vec<f64>> = a.rows().into_iter().map(|row| row.to_vec()).collect();
        expected.sort_by(|x, y| x[0].total_cmp(&y[0]));
        assert_eq!(rows, expected);
    }

    #[test]
    fn seeds_differ_per_task() {
        let a = mix_seed(1, 1, TaskPhase::Map, 0);
        assert_ne!(a, mix_seed(1, 1, TaskPhase::Map, 1));
        assert_ne!(a, mix_seed(1, 1, TaskPhase::Reduce, 0));
        assert_ne!(a, mix_seed(1, 2, TaskPhase::Map, 0));
        assert_eq!(a, mix_seed(1, 1, TaskPhase::Map, 0));
    }
}
