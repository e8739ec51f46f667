use std::io::Read;

use anyhow::{Error, bail};

/// Default capacity of the read buffer. A single trace line must fit.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 20;

/// A chunked reader that yields the logical lines of a raw trace.
///
/// Lines are terminated by `\n` (terminator excluded) and returned as
/// borrowed spans into the internal buffer, so iterating a multi-megabyte
/// trace performs no per-line allocation. Empty lines are skipped. If a
/// line straddles the end of the buffered window, the partial tail is
/// shifted to the buffer start and more data is read; a line that does not
/// fit into the buffer at all fails the read.
pub struct LineReader<R: Read> {
    input: R,
    buffer: Vec<u8>,
    pos: usize,
    end: usize,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    /// Creates a line reader with the default buffer capacity.
    pub fn new(input: R) -> Self {
        Self::with_capacity(input, DEFAULT_BUFFER_SIZE)
    }

    /// Creates a line reader with a custom buffer capacity.
    pub fn with_capacity(input: R, capacity: usize) -> Self {
        Self {
            input,
            buffer: vec![0; capacity],
            pos: 0,
            end: 0,
            eof: false,
        }
    }

    /// Returns the next non-empty line, or `None` at the end of the input.
    ///
    /// The returned span borrows the internal buffer and is only valid
    /// until the next call.
    ///
    /// # Errors
    ///
    /// This function fails if reading from the underlying input fails or
    /// if a single line exceeds the buffer capacity.
    pub fn next_line(&mut self) -> Result<Option<&[u8]>, Error> {
        let (start, end) = loop {
            if let Some(offset) = self.buffer[self.pos..self.end]
                .iter()
                .position(|&b| b == b'\n')
            {
                let start = self.pos;
                self.pos = start + offset + 1;
                if offset == 0 {
                    continue;
                }
                break (start, start + offset);
            }

            if self.eof {
                if self.pos == self.end {
                    return Ok(None);
                }
                // final line without terminator
                let start = self.pos;
                self.pos = self.end;
                break (start, self.end);
            }

            self.refill()?;
        };

        Ok(Some(&self.buffer[start..end]))
    }

    fn refill(&mut self) -> Result<(), Error> {
        // Shift the partial tail to the buffer start to make room.
        if self.pos > 0 {
            self.buffer.copy_within(self.pos..self.end, 0);
            self.end -= self.pos;
            self.pos = 0;
        }

        if self.end == self.buffer.len() {
            bail!(
                "read buffer too small: trace line exceeds {} bytes",
                self.buffer.len()
            );
        }

        let n = self.input.read(&mut self.buffer[self.end..])?;
        if n == 0 {
            self.eof = true;
        } else {
            self.end += n;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::LineReader;

    fn collect_lines<R: std::io::Read>(mut reader: LineReader<R>) -> Result<Vec<String>, Error> {
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line()? {
            lines.push(String::from_utf8(line.to_vec())?);
        }
        Ok(lines)
    }

    #[test]
    fn yields_lines_across_refills() -> Result<(), Error> {
        let input = b"first;line\nsecond\nthird;event;line\n";
        let reader = LineReader::with_capacity(&input[..], 8);

        assert_eq!(
            collect_lines(reader)?,
            vec!["first;line", "second", "third;event;line"]
        );

        Ok(())
    }

    #[test]
    fn skips_empty_lines() -> Result<(), Error> {
        let input = b"\n\na\n\nb\n\n";
        let reader = LineReader::with_capacity(&input[..], 8);

        assert_eq!(collect_lines(reader)?, vec!["a", "b"]);

        Ok(())
    }

    #[test]
    fn yields_final_line_without_terminator() -> Result<(), Error> {
        let input = b"a\nlast";
        let reader = LineReader::with_capacity(&input[..], 8);

        assert_eq!(collect_lines(reader)?, vec!["a", "last"]);

        Ok(())
    }

    #[test]
    fn fail_on_line_exceeding_buffer() {
        let input = b"0123456789abcdef\n";
        let mut reader = LineReader::with_capacity(&input[..], 8);

        reader.next_line().unwrap_err();
    }

    #[test]
    fn line_filling_exact_buffer_passes() -> Result<(), Error> {
        let input = b"0123456\nx\n";
        let reader = LineReader::with_capacity(&input[..], 8);

        assert_eq!(collect_lines(reader)?, vec!["0123456", "x"]);

        Ok(())
    }

    #[test]
    fn empty_input_yields_nothing() -> Result<(), Error> {
        let mut reader = LineReader::with_capacity(&b""[..], 8);
        assert!(reader.next_line()?.is_none());
        assert!(reader.next_line()?.is_none());

        Ok(())
    }
}
