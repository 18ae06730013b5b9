//! Output abstraction for the `PrintExpr` opcode.
//!
//! Embedders implement [`PrintWriter`] to capture or redirect output from
//! executing programs; the default [`StdPrint`] writes to stdout and
//! [`CollectStringPrint`] buffers into a string for tests.

use std::{
    borrow::Cow,
    io::{self, Write as _},
};

/// Trait for handling output produced by executing bytecode.
pub trait PrintWriter {
    /// Writes one chunk of output text, without any terminator.
    fn stdout_write(&mut self, output: Cow<'_, str>) -> io::Result<()>;

    /// Writes a single terminator/separator character.
    fn stdout_push(&mut self, end: char) -> io::Result<()>;
}

/// Default `PrintWriter` that writes to stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> io::Result<()> {
        io::stdout().write_all(output.as_bytes())
    }

    fn stdout_push(&mut self, end: char) -> io::Result<()> {
        let mut buf = [0u8; 4];
        io::stdout().write_all(end.encode_utf8(&mut buf).as_bytes())
    }
}

/// `PrintWriter` that collects all output into a string.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    output: String,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The output collected so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Takes the collected output, leaving the buffer empty.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) -> io::Result<()> {
        self.output.push_str(&output);
        Ok(())
    }

    fn stdout_push(&mut self, end: char) -> io::Result<()> {
        self.output.push(end);
        Ok(())
    }
}
