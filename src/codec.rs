use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use crate::{error::SmallError, types::SmallResult};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable: Sized {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, SmallError>;
}

pub fn read_into<T: Decodeable, R: Read>(reader: &mut R) -> Result<T, SmallError> {
    T::decode_from(reader)
}

pub fn read_exact<R: Read>(reader: &mut R, bytes_count: usize) -> Result<Vec<u8>, SmallError> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .or(Err(SmallError::new(&format!(
            "io error, expect {} bytes",
            bytes_count
        ))))?;
    Ok(buffer)
}

/// An append buffer for building encoded records.
pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A thin wrapper over `File` that reads and writes `Encodeable` /
/// `Decodeable` values.
pub struct SmallFile {
    file: File,
}

impl SmallFile {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Result<Self, SmallError> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(true)
            .open(file_path)?;

        Ok(Self { file })
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> SmallResult {
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, SmallError> {
        T::decode_from(&mut self.file)
    }

    pub fn get_size(&self) -> Result<u64, SmallError> {
        let metadata = self.file.metadata()?;
        Ok(metadata.len())
    }

    pub fn get_current_position(&mut self) -> Result<u64, SmallError> {
        let offset = self.file.seek(SeekFrom::Current(0))?;
        Ok(offset)
    }

    pub fn set_len(&self, len: u64) -> SmallResult {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64, SmallError> {
        Ok(self.file.seek(pos)?)
    }

    pub fn flush(&mut self) -> SmallResult {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl Read for SmallFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, SmallError> {
        Ok(u8::decode_from(reader)? == 1)
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: Read>(reader: &mut R) -> Result<Self, SmallError> {
                    let bytes = read_exact(reader, size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i8, i16, i32, i64);
