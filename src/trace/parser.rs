use std::io::Read;

use anyhow::{Error, bail};

use crate::trace::{
    BRANCH_TYPE_ID, BranchKind, HEAP_ALLOCATION_TYPE_ID, HEAP_MEMORY_ACCESS_TYPE_ID, ImageRecord,
    TraceRecord,
};

/// A parser for preprocessed binary traces.
pub struct TraceParser;

impl TraceParser {
    pub fn new() -> Self {
        Self {}
    }

    /// Parses a testcase trace, which consists solely of records.
    pub fn parse<R: Read>(&mut self, input: R) -> TraceIterator<R> {
        TraceIterator { input }
    }

    /// Parses a prefix trace: the image table followed by records.
    ///
    /// # Errors
    ///
    /// This function fails if the image table is truncated or malformed.
    pub fn parse_with_images<R: Read>(
        &mut self,
        mut input: R,
    ) -> Result<(Vec<ImageRecord>, TraceIterator<R>), Error> {
        let count = read_u32(&mut input)?;
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = read_i32(&mut input)?;
            let interesting = read_u8(&mut input)? != 0;
            let start = read_u64(&mut input)?;
            let end = read_u64(&mut input)?;
            let name = read_string(&mut input)?;
            images.push(ImageRecord {
                id,
                interesting,
                start,
                end,
                name,
            });
        }

        Ok((images, TraceIterator { input }))
    }
}

impl Default for TraceParser {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TraceIterator<R: Read> {
    input: R,
}

impl<R: Read> TraceIterator<R> {
    fn inner_next(&mut self) -> Result<Option<TraceRecord>, Error> {
        let mut type_id = [0u8; 1];
        if let Err(e) = self.input.read_exact(&mut type_id) {
            match e.kind() {
                std::io::ErrorKind::UnexpectedEof => return Ok(None),
                _ => bail!(e),
            }
        }

        let record = match type_id[0] {
            BRANCH_TYPE_ID => TraceRecord::Branch {
                source_image: read_i32(&mut self.input)?,
                source_address: read_u32(&mut self.input)?,
                destination_image: read_i32(&mut self.input)?,
                destination_address: read_u32(&mut self.input)?,
                taken: read_u8(&mut self.input)? != 0,
                kind: BranchKind::try_from_id(read_u8(&mut self.input)?)?,
            },
            HEAP_ALLOCATION_TYPE_ID => TraceRecord::HeapAllocation {
                id: read_i32(&mut self.input)?,
                address: read_u64(&mut self.input)?,
                size: read_u32(&mut self.input)?,
            },
            HEAP_MEMORY_ACCESS_TYPE_ID => TraceRecord::HeapMemoryAccess {
                instruction_image: read_i32(&mut self.input)?,
                instruction_address: read_u32(&mut self.input)?,
                allocation_id: read_i32(&mut self.input)?,
                memory_address: read_u32(&mut self.input)?,
                size: read_u32(&mut self.input)?,
                is_write: read_u8(&mut self.input)? != 0,
            },
            other => bail!("trace record type {other} was not recognized"),
        };

        Ok(Some(record))
    }
}

impl<R: Read> Iterator for TraceIterator<R> {
    type Item = Result<TraceRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner_next().transpose()
    }
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8, Error> {
    let mut buffer = [0u8; 1];
    input.read_exact(&mut buffer)?;
    Ok(buffer[0])
}

fn read_u32<R: Read>(input: &mut R) -> Result<u32, Error> {
    let mut buffer = [0u8; 4];
    input.read_exact(&mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

fn read_i32<R: Read>(input: &mut R) -> Result<i32, Error> {
    let mut buffer = [0u8; 4];
    input.read_exact(&mut buffer)?;
    Ok(i32::from_le_bytes(buffer))
}

fn read_u64<R: Read>(input: &mut R) -> Result<u64, Error> {
    let mut buffer = [0u8; 8];
    input.read_exact(&mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}

fn read_string<R: Read>(input: &mut R) -> Result<String, Error> {
    let length = read_u32(input)?;
    let mut buffer = vec![0u8; length as usize];
    input.read_exact(&mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
