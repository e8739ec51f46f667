use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::Error;

use crate::trace::{ImageRecord, TraceRecord};

/// A length-prefixed little-endian writer producing the on-disk trace
/// format.
///
/// The encoder is backed either by a growable in-memory buffer (sized by
/// an estimate of the input, typically the raw trace's byte length) or by
/// a buffered file sink. Both variants flush on [`finish`].
///
/// [`finish`]: TraceEncoder::finish
pub struct TraceEncoder {
    sink: Sink,
}

enum Sink {
    Memory(Vec<u8>),
    File(BufWriter<File>),
}

impl TraceEncoder {
    /// Creates an encoder writing into a memory buffer with the given
    /// initial capacity estimate.
    pub fn in_memory(capacity_hint: usize) -> Self {
        Self {
            sink: Sink::Memory(Vec::with_capacity(capacity_hint)),
        }
    }

    /// Creates an encoder writing into the given file.
    ///
    /// # Errors
    ///
    /// This function fails if the file cannot be created.
    pub fn to_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(Self {
            sink: Sink::File(BufWriter::new(File::create(path)?)),
        })
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match &mut self.sink {
            Sink::Memory(buffer) => buffer.extend_from_slice(bytes),
            Sink::File(writer) => writer.write_all(bytes)?,
        }

        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write_bytes(&[value])
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), Error> {
        self.write_u8(value as u8)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), Error> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a UTF-8 string prefixed by its byte length.
    pub fn write_str(&mut self, value: &str) -> Result<(), Error> {
        self.write_u32(u32::try_from(value.len())?)?;
        self.write_bytes(value.as_bytes())
    }

    /// Writes the image table that heads a prefix trace.
    pub fn write_image_table(&mut self, images: &[ImageRecord]) -> Result<(), Error> {
        self.write_u32(u32::try_from(images.len())?)?;
        for image in images {
            self.write_i32(image.id)?;
            self.write_u8(image.interesting as u8)?;
            self.write_u64(image.start)?;
            self.write_u64(image.end)?;
            self.write_str(&image.name)?;
        }

        Ok(())
    }

    /// Writes one trace record: a type byte followed by its fixed fields.
    pub fn write_record(&mut self, record: &TraceRecord) -> Result<(), Error> {
        self.write_u8(record.type_id())?;

        match *record {
            TraceRecord::Branch {
                source_image,
                source_address,
                destination_image,
                destination_address,
                taken,
                kind,
            } => {
                self.write_i32(source_image)?;
                self.write_u32(source_address)?;
                self.write_i32(destination_image)?;
                self.write_u32(destination_address)?;
                self.write_bool(taken)?;
                self.write_u8(kind.id())?;
            }
            TraceRecord::HeapAllocation { id, address, size } => {
                self.write_i32(id)?;
                self.write_u64(address)?;
                self.write_u32(size)?;
            }
            TraceRecord::HeapMemoryAccess {
                instruction_image,
                instruction_address,
                allocation_id,
                memory_address,
                size,
                is_write,
            } => {
                self.write_i32(instruction_image)?;
                self.write_u32(instruction_address)?;
                self.write_i32(allocation_id)?;
                self.write_u32(memory_address)?;
                self.write_u32(size)?;
                self.write_bool(is_write)?;
            }
        }

        Ok(())
    }

    /// Flushes the sink and returns the written bytes for memory-backed
    /// encoders.
    ///
    /// # Errors
    ///
    /// This function fails if flushing a file-backed sink fails.
    pub fn finish(self) -> Result<Option<Vec<u8>>, Error> {
        match self.sink {
            Sink::Memory(buffer) => Ok(Some(buffer)),
            Sink::File(mut writer) => {
                writer.flush()?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::TraceEncoder;
    use crate::trace::{BranchKind, ImageRecord, TraceRecord};

    #[test]
    fn encode_branch_record() -> Result<(), Error> {
        let mut encoder = TraceEncoder::in_memory(0);
        encoder.write_record(&TraceRecord::Branch {
            source_image: 0,
            source_address: (1 << 13) | 2,
            destination_image: 1,
            destination_address: 2 << 13,
            taken: true,
            kind: BranchKind::Call,
        })?;

        let mut expected = vec![1u8];
        expected.extend(0_i32.to_le_bytes());
        expected.extend(((1_u32 << 13) | 2).to_le_bytes());
        expected.extend(1_i32.to_le_bytes());
        expected.extend((2_u32 << 13).to_le_bytes());
        expected.push(1);
        expected.push(1);

        assert_eq!(encoder.finish()?.unwrap(), expected);

        Ok(())
    }

    #[test]
    fn encode_heap_allocation_record() -> Result<(), Error> {
        let mut encoder = TraceEncoder::in_memory(0);
        encoder.write_record(&TraceRecord::HeapAllocation {
            id: 42,
            address: 0x20_0000,
            size: 0x20_0000,
        })?;

        let mut expected = vec![2u8];
        expected.extend(42_i32.to_le_bytes());
        expected.extend(0x20_0000_u64.to_le_bytes());
        expected.extend(0x20_0000_u32.to_le_bytes());

        assert_eq!(encoder.finish()?.unwrap(), expected);

        Ok(())
    }

    #[test]
    fn encode_heap_memory_access_record() -> Result<(), Error> {
        let mut encoder = TraceEncoder::in_memory(0);
        encoder.write_record(&TraceRecord::HeapMemoryAccess {
            instruction_image: 0,
            instruction_address: 5 << 13,
            allocation_id: 42,
            memory_address: 0x10_0000,
            size: 1,
            is_write: true,
        })?;

        let mut expected = vec![3u8];
        expected.extend(0_i32.to_le_bytes());
        expected.extend((5_u32 << 13).to_le_bytes());
        expected.extend(42_i32.to_le_bytes());
        expected.extend(0x10_0000_u32.to_le_bytes());
        expected.extend(1_u32.to_le_bytes());
        expected.push(1);

        assert_eq!(encoder.finish()?.unwrap(), expected);

        Ok(())
    }

    #[test]
    fn encode_image_table() -> Result<(), Error> {
        let mut encoder = TraceEncoder::in_memory(0);
        encoder.write_image_table(&[ImageRecord {
            id: 0,
            interesting: true,
            start: 0,
            end: 0xFFFF_FFFF,
            name: String::from("app.js"),
        }])?;

        let mut expected = Vec::new();
        expected.extend(1_u32.to_le_bytes());
        expected.extend(0_i32.to_le_bytes());
        expected.push(1);
        expected.extend(0_u64.to_le_bytes());
        expected.extend(0xFFFF_FFFF_u64.to_le_bytes());
        expected.extend(6_u32.to_le_bytes());
        expected.extend(b"app.js");

        assert_eq!(encoder.finish()?.unwrap(), expected);

        Ok(())
    }
}
