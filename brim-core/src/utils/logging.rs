//! Logging initialization with secret redaction
//!
//! Structured tracing output (plain or JSON) routed through a writer that
//! applies the process redactor line by line, so credentials cannot reach
//! any sink. ASCII-only by default via the standard formatter.

use crate::utils::secrets::Redactor;
use anyhow::Result;
use std::io::{self, Write};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `io::Write` wrapper that redacts complete lines before forwarding.
pub struct RedactingWriter<W: Write> {
    inner: W,
    redactor: Redactor,
    buffer: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&self.buffer);
        let redacted = self.redactor.redact(&line);
        self.inner.write_all(redacted.as_bytes())?;
        self.buffer.clear();
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.buffer.push(byte);
            if byte == b'\n' {
                self.flush_buffer()?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}

#[derive(Clone)]
pub struct RedactingStdout {
    redactor: Redactor,
}

impl<'a> MakeWriter<'a> for RedactingStdout {
    type Writer = RedactingWriter<io::Stdout>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: io::stdout(),
            redactor: self.redactor.clone(),
            buffer: Vec::new(),
        }
    }
}

/// Initialize tracing with an env-filter default and the redacting sink.
pub fn init_logging(level: &str, json: bool, redactor: Redactor) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let writer = RedactingStdout { redactor };

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(writer))
            .with(filter)
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(writer))
            .with(filter)
            .try_init()
            .ok();
    }
    Ok(())
}
