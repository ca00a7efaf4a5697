//! # Row Codec
//!
//! Rows travel between stages as Hadoop "typed bytes": a one-byte type code
//! followed by a big-endian payload. A record is a key item followed by a
//! value item.
//!
//! - Ingest is liberal. A row may be a length-prefixed vector or an
//!   end-marker-terminated list, and each element may be a boolean, byte,
//!   int, long, float, or double; everything is promoted to `f64`. A string
//!   holding whitespace-separated numbers is also accepted as a row.
//! - Egress is homogeneous: always a vector of doubles, so that the size of
//!   the inter-stage shuffle is predictable.

use crate::types::{GroupKey, Record, RecordKey};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

// Length prefixes are untrusted; buffers grow as items arrive past this.
const MAX_PREALLOCATION: usize = 4096;

/// Deepest container nesting accepted inside an opaque key.
pub const MAX_NESTING: usize = 64;

/// The type codes of the typed-bytes format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Bytes,
    Byte,
    Bool,
    Int,
    Long,
    Float,
    Double,
    String,
    Vector,
    List,
    Map,
    ListEnd,
    /// Codes 50..=200 carry application-defined byte sequences.
    Application(u8),
}

impl TypeCode {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        Ok(match byte {
            0 => Self::Bytes,
            1 => Self::Byte,
            2 => Self::Bool,
            3 => Self::Int,
            4 => Self::Long,
            5 => Self::Float,
            6 => Self::Double,
            7 => Self::String,
            8 => Self::Vector,
            9 => Self::List,
            10 => Self::Map,
            255 => Self::ListEnd,
            50..=200 => Self::Application(byte),
            other => return Err(CodecError::UnknownTypeCode(other)),
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Bytes => 0,
            Self::Byte => 1,
            Self::Bool => 2,
            Self::Int => 3,
            Self::Long => 4,
            Self::Float => 5,
            Self::Double => 6,
            Self::String => 7,
            Self::Vector => 8,
            Self::List => 9,
            Self::Map => 10,
            Self::ListEnd => 255,
            Self::Application(byte) => byte,
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bytes => "bytes",
            Self::Byte => "byte",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Vector => "vector",
            Self::List => "list",
            Self::Map => "map",
            Self::ListEnd => "list end marker",
            Self::Application(byte) => return write!(f, "application type {byte}"),
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error while reading typed bytes: {0}")]
    Io(#[from] io::Error),

    #[error("unknown typed-bytes type code {0}")]
    UnknownTypeCode(u8),

    #[error("a row must be a vector, list, or string, but found {0}")]
    NotARow(TypeCode),

    #[error("row element {index} has type {code}, which cannot be converted to a double")]
    UnsupportedElement { index: usize, code: TypeCode },

    #[error("negative sequence length {0}")]
    NegativeLength(i32),

    #[error("'{token}' in a text row is not a number")]
    MalformedText { token: String },

    #[error("list end marker outside of a list")]
    UnexpectedListEnd,

    #[error("row of {0} columns is too long to encode")]
    RowTooLong(usize),

    #[error("containers nested deeper than {MAX_NESTING} levels")]
    NestingTooDeep,
}

fn truncated() -> CodecError {
    CodecError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}

/// Parses a whitespace-separated text row into `row`, replacing its contents.
pub fn parse_text_row(text: &str, row: &mut Vec<f64>) -> Result<(), CodecError> {
    row.clear();
    for token in text.split_ascii_whitespace() {
        let value = lexical_core::parse::<f64>(token.as_bytes()).map_err(|_| {
            CodecError::MalformedText {
                token: token.to_string(),
            }
        })?;
        row.push(value);
    }
    Ok(())
}

/// Streaming reader over a typed-bytes byte stream.
pub struct TypedBytesReader<R> {
    inner: R,
}

impl<R: Read> TypedBytesReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next type code, or `None` at a clean end of stream.
    pub fn next_type(&mut self) -> Result<Option<TypeCode>, CodecError> {
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return TypeCode::from_byte(byte[0]).map(Some),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn expect_type(&mut self) -> Result<TypeCode, CodecError> {
        self.next_type()?.ok_or_else(truncated)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_length(&mut self) -> Result<usize, CodecError> {
        let len = i32::from_be_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
    }

    // Appends exactly `len` payload bytes to `buf`, failing on a short stream.
    fn read_payload(&mut self, len: usize, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.reserve(len.min(MAX_PREALLOCATION));
        let read = (&mut self.inner).take(len as u64).read_to_end(buf)?;
        if read != len {
            return Err(truncated());
        }
        Ok(())
    }

    /// Reads the payload of a scalar whose code was already consumed and promotes
    /// it to `f64`. Returns `None` for non-numeric codes without consuming anything.
    fn read_number(&mut self, code: TypeCode) -> Result<Option<f64>, CodecError> {
        let value = match code {
            TypeCode::Bool => {
                let [byte] = self.read_array::<1>()?;
                if byte != 0 { 1.0 } else { 0.0 }
            }
            TypeCode::Byte => f64::from(i8::from_be_bytes(self.read_array()?)),
            TypeCode::Int => f64::from(i32::from_be_bytes(self.read_array()?)),
            TypeCode::Long => i64::from_be_bytes(self.read_array()?) as f64,
            TypeCode::Float => f64::from(f32::from_be_bytes(self.read_array()?)),
            TypeCode::Double => f64::from_be_bytes(self.read_array()?),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }

    /// Reads one row value into `row`. Returns `false` at a clean end of stream.
    pub fn read_row(&mut self, row: &mut Vec<f64>) -> Result<bool, CodecError> {
        match self.next_type()? {
            Some(code) => self.read_row_body(code, row).map(|()| true),
            None => Ok(false),
        }
    }

    fn read_row_body(&mut self, code: TypeCode, row: &mut Vec<f64>) -> Result<(), CodecError> {
        row.clear();
        match code {
            TypeCode::Vector => {
                let len = self.read_length()?;
                row.reserve(len.min(MAX_PREALLOCATION));
                for index in 0..len {
                    let element = self.expect_type()?;
                    match self.read_number(element)? {
                        Some(value) => row.push(value),
                        None => {
                            return Err(CodecError::UnsupportedElement {
                                index,
                                code: element,
                            });
                        }
                    }
                }
                Ok(())
            }
            TypeCode::List => loop {
                let element = self.expect_type()?;
                if element == TypeCode::ListEnd {
                    return Ok(());
                }
                match self.read_number(element)? {
                    Some(value) => row.push(value),
                    None => {
                        return Err(CodecError::UnsupportedElement {
                            index: row.len(),
                            code: element,
                        });
                    }
                }
            },
            TypeCode::String => {
                let len = self.read_length()?;
                let mut bytes = Vec::new();
                self.read_payload(len, &mut bytes)?;
                let text = String::from_utf8_lossy(&bytes);
                parse_text_row(&text, row)
            }
            other => Err(CodecError::NotARow(other)),
        }
    }

    /// Reads a record key, or `None` at a clean end of stream.
    pub fn read_key(&mut self) -> Result<Option<RecordKey>, CodecError> {
        let Some(code) = self.next_type()? else {
            return Ok(None);
        };
        let key = match code {
            TypeCode::Byte => RecordKey::Int(i64::from(i8::from_be_bytes(self.read_array()?))),
            TypeCode::Int => RecordKey::Int(i64::from(i32::from_be_bytes(self.read_array()?))),
            TypeCode::Long => RecordKey::Int(i64::from_be_bytes(self.read_array()?)),
            other => {
                let mut bytes = Vec::new();
                self.read_opaque(other, &mut bytes)?;
                RecordKey::Opaque(bytes)
            }
        };
        Ok(Some(key))
    }

    /// Reads a key/row record, or `None` at a clean end of stream.
    pub fn read_record(&mut self) -> Result<Option<Record>, CodecError> {
        let Some(key) = self.read_key()? else {
            return Ok(None);
        };
        let mut row = Vec::new();
        if !self.read_row(&mut row)? {
            return Err(truncated());
        }
        Ok(Some(Record { key, row }))
    }

    /// Copies the item whose code was already consumed, code byte included, into `buf`.
    pub fn read_opaque(&mut self, code: TypeCode, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.read_nested(code, buf, 0)
    }

    fn read_nested(
        &mut self,
        code: TypeCode,
        buf: &mut Vec<u8>,
        depth: usize,
    ) -> Result<(), CodecError> {
        if depth >= MAX_NESTING {
            return Err(CodecError::NestingTooDeep);
        }
        buf.push(code.code());
        match code {
            TypeCode::Byte | TypeCode::Bool => buf.extend_from_slice(&self.read_array::<1>()?),
            TypeCode::Int | TypeCode::Float => buf.extend_from_slice(&self.read_array::<4>()?),
            TypeCode::Long | TypeCode::Double => buf.extend_from_slice(&self.read_array::<8>()?),
            TypeCode::Bytes | TypeCode::String | TypeCode::Application(_) => {
                let len = self.read_length()?;
                buf.extend_from_slice(&(len as i32).to_be_bytes());
                self.read_payload(len, buf)?;
            }
            TypeCode::Vector | TypeCode::Map => {
                let len = self.read_length()?;
                buf.extend_from_slice(&(len as i32).to_be_bytes());
                let items = if code == TypeCode::Map { 2 * len } else { len };
                for _ in 0..items {
                    let item = self.expect_type()?;
                    if item == TypeCode::ListEnd {
                        return Err(CodecError::UnexpectedListEnd);
                    }
                    self.read_nested(item, buf, depth + 1)?;
                }
            }
            TypeCode::List => loop {
                let item = self.expect_type()?;
                if item == TypeCode::ListEnd {
                    buf.push(TypeCode::ListEnd.code());
                    break;
                }
                self.read_nested(item, buf, depth + 1)?;
            },
            TypeCode::ListEnd => return Err(CodecError::UnexpectedListEnd),
        }
        Ok(())
    }
}

/// Streaming writer producing typed bytes.
pub struct TypedBytesWriter<W> {
    inner: W,
}

impl<W: Write> TypedBytesWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_code(&mut self, code: TypeCode) -> io::Result<()> {
        self.inner.write_all(&[code.code()])
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_code(TypeCode::Bool)?;
        self.inner.write_all(&[u8::from(value)])
    }

    pub fn write_byte(&mut self, value: i8) -> io::Result<()> {
        self.write_code(TypeCode::Byte)?;
        self.inner.write_all(&value.to_be_bytes())
    }

    pub fn write_int(&mut self, value: i32) -> io::Result<()> {
        self.write_code(TypeCode::Int)?;
        self.inner.write_all(&value.to_be_bytes())
    }

    pub fn write_long(&mut self, value: i64) -> io::Result<()> {
        self.write_code(TypeCode::Long)?;
        self.inner.write_all(&value.to_be_bytes())
    }

    pub fn write_float(&mut self, value: f32) -> io::Result<()> {
        self.write_code(TypeCode::Float)?;
        self.inner.write_all(&value.to_be_bytes())
    }

    pub fn write_double(&mut self, value: f64) -> io::Result<()> {
        self.write_code(TypeCode::Double)?;
        self.inner.write_all(&value.to_be_bytes())
    }

    pub fn write_string(&mut self, value: &str) -> io::Result<()> {
        self.write_code(TypeCode::String)?;
        self.inner.write_all(&(value.len() as i32).to_be_bytes())?;
        self.inner.write_all(value.as_bytes())
    }

    pub fn write_list_start(&mut self) -> io::Result<()> {
        self.write_code(TypeCode::List)
    }

    pub fn write_list_end(&mut self) -> io::Result<()> {
        self.write_code(TypeCode::ListEnd)
    }

    /// Writes `row` as a length-prefixed vector of doubles.
    pub fn write_row(&mut self, row: &[f64]) -> Result<(), CodecError> {
        let len = i32::try_from(row.len()).map_err(|_| CodecError::RowTooLong(row.len()))?;
        self.write_code(TypeCode::Vector)?;
        self.inner.write_all(&len.to_be_bytes())?;
        for &value in row {
            self.write_double(value)?;
        }
        Ok(())
    }

    pub fn write_record(&mut self, key: GroupKey, row: &[f64]) -> Result<(), CodecError> {
        // Keys are below 2^31 and therefore always fit an int.
        self.write_int(key.get() as i32)?;
        self.write_row(row)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Encodes `row` in the egress form: a vector of doubles.
pub fn encode_row(row: &[f64]) -> Result<Vec<u8>, CodecError> {
    let mut writer = TypedBytesWriter::new(Vec::with_capacity(5 + 9 * row.len()));
    writer.write_row(row)?;
    Ok(writer.into_inner())
}

/// Decodes one row value from `bytes`.
pub fn decode_row(bytes: &[u8]) -> Result<Vec<f64>, CodecError> {
    let mut reader = TypedBytesReader::new(bytes);
    let mut row = Vec::new();
    if !reader.read_row(&mut row)? {
        return Err(truncated());
    }
    Ok(row)
}
