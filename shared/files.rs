// ========================================================================================
//                              Local filesystem substrate
// ========================================================================================
//
// Stage inputs and outputs on a local disk. An input is a file or a directory of
// files; a stage output is a directory of `part-r-NNNNN` typed-bytes files, one per
// reducer that received rows. Parts are written under a hidden name and renamed on
// completion, so a reader never observes a half-written part.

use crate::codec::{CodecError, TypedBytesReader, TypedBytesWriter, parse_text_row};
use crate::compressor::{CompressError, RowSink};
use crate::stage::{OutputFactory, PartitionSource, RecordReader, StageError, TaskError};
use crate::types::{GroupKey, Record, RecordKey};
use flate2::read::MultiGzDecoder;
use log::debug;
use natord::compare;
use ndarray::{Array2, ArrayBase, Data, Ix2};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const PART_FILE_PREFIX: &str = "part-r-";

const HIDDEN_PREFIXES: [char; 2] = ['_', '.'];

pub fn part_file_name(reducer: usize) -> String {
    format!("{PART_FILE_PREFIX}{reducer:05}")
}

/// How a single input file is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    TypedBytes,
    /// One row per non-empty line, whitespace separated.
    Text,
    GzipText,
    GzipTypedBytes,
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

impl InputFormat {
    /// Picks the decoder from the file name. A `.gz` file is judged by the extension
    /// underneath it, so `a.txt.gz` is gzipped text and `part-r-00000.gz` is gzipped
    /// typed bytes.
    pub fn detect(path: &Path) -> Self {
        let is_text = |ext: Option<&str>| matches!(ext, Some("txt") | Some("tsv"));
        let extension = lowercase_extension(path);
        match extension.as_deref() {
            Some("gz") => {
                let inner = path.file_stem().map(Path::new).and_then(lowercase_extension);
                if is_text(inner.as_deref()) {
                    Self::GzipText
                } else {
                    Self::GzipTypedBytes
                }
            }
            ext if is_text(ext) => Self::Text,
            _ => Self::TypedBytes,
        }
    }
}

fn compare_paths(a: &Path, b: &Path) -> std::cmp::Ordering {
    let a_str = a
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| a.to_string_lossy().into_owned());
    let b_str = b
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| b.to_string_lossy().into_owned());
    compare(&a_str, &b_str)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with(HIDDEN_PREFIXES))
        .unwrap_or(false)
}

fn prepare_error(path: &Path) -> impl FnOnce(io::Error) -> StageError + '_ {
    move |source| StageError::Prepare {
        path: path.to_path_buf(),
        source,
    }
}

/// The data files behind `path`: the file itself, or the visible regular files of a
/// directory in natural order. An empty directory yields no files.
pub fn resolve_input_files(path: &Path) -> Result<Vec<PathBuf>, StageError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StageError::MissingInput(path.to_path_buf()));
        }
        Err(e) => return Err(prepare_error(path)(e)),
    };
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path).map_err(prepare_error(path))? {
        let entry = entry.map_err(prepare_error(path))?;
        let file = entry.path();
        if file.is_file() && !is_hidden(&file) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| compare_paths(a, b));
    Ok(files)
}

/// Groups `files` in order into partitions of at least `split_size` bytes. Without a
/// split size every file is its own partition.
pub fn plan_partitions(
    files: Vec<PathBuf>,
    split_size: Option<u64>,
) -> Result<Vec<Vec<PathBuf>>, StageError> {
    let Some(min_bytes) = split_size else {
        return Ok(files.into_iter().map(|file| vec![file]).collect());
    };

    let mut partitions = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0u64;
    for file in files {
        current_bytes += fs::metadata(&file).map_err(prepare_error(&file))?.len();
        current.push(file);
        if current_bytes >= min_bytes {
            partitions.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
    }
    if !current.is_empty() {
        partitions.push(current);
    }
    Ok(partitions)
}

/// The partitioned files of one stage input.
#[derive(Debug, Clone)]
pub struct FileSource {
    partitions: Vec<Vec<PathBuf>>,
}

impl FileSource {
    pub fn open(path: &Path, split_size: Option<u64>) -> Result<Self, StageError> {
        let files = resolve_input_files(path)?;
        let partitions = plan_partitions(files, split_size)?;
        debug!(
            "{} partitions from '{}'",
            partitions.len(),
            path.display()
        );
        Ok(Self { partitions })
    }
}

impl PartitionSource for FileSource {
    type Reader = PartitionReader;

    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn open(&self, partition: usize) -> Result<PartitionReader, TaskError> {
        Ok(PartitionReader {
            pending: self.partitions[partition].clone().into_iter(),
            current: None,
        })
    }
}

enum FileRecords {
    Typed(TypedBytesReader<Box<dyn Read>>),
    Text {
        path: PathBuf,
        lines: Box<dyn BufRead>,
        line: String,
        line_number: i64,
    },
}

impl FileRecords {
    fn open(path: &Path) -> Result<Self, TaskError> {
        let file = File::open(path).map_err(|source| TaskError::Input {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(match InputFormat::detect(path) {
            InputFormat::TypedBytes => {
                Self::Typed(TypedBytesReader::new(Box::new(BufReader::new(file))))
            }
            InputFormat::GzipTypedBytes => Self::Typed(TypedBytesReader::new(Box::new(
                BufReader::new(MultiGzDecoder::new(file)),
            ))),
            InputFormat::Text => Self::text(path, Box::new(BufReader::new(file))),
            InputFormat::GzipText => {
                Self::text(path, Box::new(BufReader::new(MultiGzDecoder::new(file))))
            }
        })
    }

    fn text(path: &Path, lines: Box<dyn BufRead>) -> Self {
        Self::Text {
            path: path.to_path_buf(),
            lines,
            line: String::new(),
            line_number: 0,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>, TaskError> {
        match self {
            Self::Typed(reader) => Ok(reader.read_record()?),
            Self::Text {
                path,
                lines,
                line,
                line_number,
            } => loop {
                line.clear();
                let read = lines.read_line(line).map_err(|source| TaskError::Input {
                    path: path.clone(),
                    source,
                })?;
                if read == 0 {
                    return Ok(None);
                }
                *line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let mut row = Vec::new();
                parse_text_row(line, &mut row)?;
                return Ok(Some(Record {
                    key: RecordKey::Int(*line_number),
                    row,
                }));
            },
        }
    }
}

/// Reads the files of one partition back to back.
pub struct PartitionReader {
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<FileRecords>,
}

impl RecordReader for PartitionReader {
    fn next_record(&mut self) -> Result<Option<Record>, TaskError> {
        loop {
            if let Some(records) = self.current.as_mut() {
                if let Some(record) = records.next_record()? {
                    return Ok(Some(record));
                }
                self.current = None;
            }
            match self.pending.next() {
                Some(path) => self.current = Some(FileRecords::open(&path)?),
                None => return Ok(None),
            }
        }
    }
}

/// A stage output directory receiving one part file per non-empty reducer.
#[derive(Debug, Clone)]
pub struct PartDirectory {
    dir: PathBuf,
}

impl PartDirectory {
    pub fn create(dir: &Path) -> Result<Self, StageError> {
        fs::create_dir_all(dir).map_err(prepare_error(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn output_error(path: &Path, err: CodecError) -> TaskError {
    match err {
        CodecError::Io(source) => TaskError::Output {
            path: path.to_path_buf(),
            source,
        },
        other => TaskError::Decode(other),
    }
}

pub struct PartFileWriter {
    staging: PathBuf,
    target: PathBuf,
    writer: TypedBytesWriter<BufWriter<File>>,
}

impl RowSink for PartFileWriter {
    type Error = TaskError;

    fn emit(&mut self, key: GroupKey, row: &[f64]) -> Result<(), TaskError> {
        self.writer
            .write_record(key, row)
            .map_err(|e| output_error(&self.staging, e))
    }
}

impl OutputFactory for PartDirectory {
    type Writer = PartFileWriter;

    fn create(&self, reducer: usize) -> Result<PartFileWriter, TaskError> {
        let name = part_file_name(reducer);
        let staging = self.dir.join(format!("{}{name}", HIDDEN_PREFIXES[0]));
        let target = self.dir.join(name);
        let file = File::create(&staging).map_err(|source| TaskError::Output {
            path: staging.clone(),
            source,
        })?;
        Ok(PartFileWriter {
            staging,
            target,
            writer: TypedBytesWriter::new(BufWriter::new(file)),
        })
    }

    fn finish(&self, writer: PartFileWriter) -> Result<(), TaskError> {
        let PartFileWriter {
            staging,
            target,
            writer,
        } = writer;
        let failed = |source: io::Error| TaskError::Output {
            path: staging.clone(),
            source,
        };
        let mut buffered = writer.into_inner();
        buffered.flush().map_err(failed)?;
        drop(buffered);
        fs::rename(&staging, &target).map_err(|source| TaskError::Output {
            path: target.clone(),
            source,
        })?;
        debug!("wrote '{}'", target.display());
        Ok(())
    }
}

/// Removes a stage output, file or directory. A missing path is not an error.
pub fn clear_output(path: &Path) -> Result<(), StageError> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(prepare_error(path))
}

/// Reads every record under `path`, in partition order.
pub fn read_records(path: &Path) -> Result<Vec<Record>, StageError> {
    let source = FileSource::open(path, None)?;
    let mut records = Vec::new();
    for partition in 0..source.partition_count() {
        let failed = |source| StageError::MapTask { partition, source };
        let mut reader = PartitionSource::open(&source, partition).map_err(failed)?;
        while let Some(record) = reader.next_record().map_err(failed)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Reads the rows under `path` into a dense matrix.
pub fn read_matrix(path: &Path) -> Result<Array2<f64>, StageError> {
    let records = read_records(path)?;
    let ncols = records.first().map_or(0, |record| record.row.len());
    let mut values = Vec::with_capacity(records.len() * ncols);
    for record in &records {
        if record.row.len() != ncols {
            return Err(StageError::MapTask {
                partition: 0,
                source: TaskError::Compress(CompressError::ShapeMismatch {
                    expected: ncols,
                    found: record.row.len(),
                }),
            });
        }
        values.extend_from_slice(&record.row);
    }
    Array2::from_shape_vec((records.len(), ncols), values).map_err(|e| StageError::Prepare {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })
}

/// Writes `a` as a typed-bytes record file keyed by row number.
pub fn write_typed_matrix<S: Data<Elem = f64>>(
    path: &Path,
    a: &ArrayBase<S, Ix2>,
) -> Result<(), CodecError> {
    let mut writer = TypedBytesWriter::new(BufWriter::new(File::create(path)?));
    let mut row = Vec::with_capacity(a.ncols());
    for (i, values) in a.rows().into_iter().enumerate() {
        row.clear();
        row.extend(values.iter().copied());
        writer.write_long(i as i64)?;
        writer.write_row(&row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `a` as whitespace-separated text, one row per line.
pub fn write_text_matrix<W: Write, S: Data<Elem = f64>>(
    out: &mut W,
    a: &ArrayBase<S, Ix2>,
) -> io::Result<()> {
    let mut buffer = ryu::Buffer::new();
    for row in a.rows() {
        for (j, value) in row.iter().enumerate() {
            if j > 0 {
                out.write_all(b" ")?;
            }
            out.write_all(buffer.format(*value).as_bytes())?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn formats_are_chosen_by_extension() {
        assert_eq!(InputFormat::detect(Path::new("a.txt")), InputFormat::Text);
        assert_eq!(InputFormat::detect(Path::new("a.TSV")), InputFormat::Text);
        assert_eq!(InputFormat::detect(Path::new("a.txt.gz")), InputFormat::GzipText);
        assert_eq!(
            InputFormat::detect(Path::new("part-r-00000.gz")),
            InputFormat::GzipTypedBytes
        );
        assert_eq!(InputFormat::detect(Path::new("m.bseq.GZ")), InputFormat::GzipTypedBytes);
        assert_eq!(InputFormat::detect(Path::new("part-r-00000")), InputFormat::TypedBytes);
        assert_eq!(InputFormat::detect(Path::new("m.bseq")), InputFormat::TypedBytes);
    }

    #[test]
    fn directories_skip_hidden_files_and_sort_naturally() {
        let dir = tempdir().unwrap();
        for name in ["part-10", "part-2", "part-1", "_SUCCESS", ".crc", "_logs"] {
            File::create(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        let files = resolve_input_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["part-1", "part-2", "part-10"]);
    }

    #[test]
    fn missing_inputs_are_reported() {
        let dir = tempdir().unwrap();
        let err = resolve_input_files(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, StageError::MissingInput(_)));
    }

    #[test]
    fn split_size_coalesces_small_files() {
        let dir = tempdir().unwrap();
        let mut files = Vec::new();
        for (i, size) in [10usize, 10, 30, 5].into_iter().enumerate() {
            let path = dir.path().join(format!("f{i}"));
            fs::write(&path, vec![0u8; size]).unwrap();
            files.push(path);
        }
        let grouped = plan_partitions(files.clone(), Some(20)).unwrap();
        let sizes: Vec<usize> = grouped.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 1, 1]);
        assert_eq!(plan_partitions(files, None).unwrap().len(), 4);
    }

    #[test]
    fn text_and_gzip_inputs_are_read_as_rows() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "1 2\n\n3\t4\n").unwrap();
        let gz = File::create(dir.path().join("b.txt.gz")).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(gz, flate2::Compression::default());
        encoder.write_all(b"5 6\n").unwrap();
        encoder.finish().unwrap();

        let a = read_matrix(dir.path()).unwrap();
        assert_eq!(a, array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let records = read_records(&dir.path().join("a.txt")).unwrap();
        assert_eq!(records[1].key, RecordKey::Int(3));
    }

    #[test]
    fn gzipped_typed_bytes_parts_are_read_as_rows() {
        let dir = tempdir().unwrap();
        let gz = File::create(dir.path().join("part-r-00000.gz")).unwrap();
        let encoder = flate2::write::GzEncoder::new(gz, flate2::Compression::default());
        let mut writer = TypedBytesWriter::new(encoder);
        writer.write_record(GroupKey::new(4), &[1.5, -2.0]).unwrap();
        writer.write_record(GroupKey::new(8), &[3.0, 0.25]).unwrap();
        writer.into_inner().finish().unwrap();

        let records = read_records(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, RecordKey::Int(4));
        assert_eq!(records[1].row, vec![3.0, 0.25]);
        let a = read_matrix(dir.path()).unwrap();
        assert_eq!(a, array![[1.5, -2.0], [3.0, 0.25]]);
    }

    #[test]
    fn malformed_text_fails_the_partition() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, "1 2\n1 x\n").unwrap();
        let err = read_records(&path).unwrap_err();
        assert!(matches!(
            err,
            StageError::MapTask {
                source: TaskError::Decode(CodecError::MalformedText { .. }),
                ..
            }
        ));
    }

    #[test]
    fn part_files_appear_only_when_finished() {
        let dir = tempdir().unwrap();
        let out = PartDirectory::create(&dir.path().join("out")).unwrap();
        let mut writer = out.create(3).unwrap();
        writer.emit(GroupKey::new(9), &[1.0, 2.0]).unwrap();
        assert!(read_records(out.path()).unwrap().is_empty());
        out.finish(writer).unwrap();

        let records = read_records(out.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, RecordKey::Int(9));
        assert_eq!(records[0].row, vec![1.0, 2.0]);
        assert!(out.path().join("part-r-00003").is_file());
    }

    #[test]
    fn typed_matrices_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.bseq");
        let a = array![[1.5, -2.0, 0.0], [4.0, 5.0, 6.25]];
        write_typed_matrix(&path, &a).unwrap();
        assert_eq!(read_matrix(&path).unwrap(), a);
    }

    #[test]
    fn clearing_outputs() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(sub.join("deep")).unwrap();
        clear_output(&file).unwrap();
        clear_output(&sub).unwrap();
        clear_output(&dir.path().join("absent")).unwrap();
        assert!(!file.exists());
        assert!(!sub.exists());
    }

    #[test]
    fn text_output_uses_shortest_round_trip_floats() {
        let mut out = Vec::new();
        write_text_matrix(&mut out, &array![[1.0, 0.1], [-2.5, 3e-20]]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1.0 0.1\n-2.5 3e-20\n");
    }
}
