// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prints the progress of a run to the terminal.

use nodetest_runner::{
    orchestrator::RunStats,
    reporter::{Location, RunReporter, TestFailure, TestHandle},
};
use owo_colors::{OwoColorize, Style, style};
use std::{
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use swrite::{SWrite, swrite, swriteln};

/// Styles used by [`ConsoleReporter`].
#[derive(Clone, Debug, Default)]
pub(crate) struct ReporterStyles {
    pass: Style,
    fail: Style,
    skip: Style,
    start: Style,
    count: Style,
    dimmed: Style,
}

impl ReporterStyles {
    pub(crate) fn colorize(&mut self) {
        self.pass = style().green().bold();
        self.fail = style().red().bold();
        self.skip = style().yellow().bold();
        self.start = style().bold();
        self.count = style().bold();
        self.dimmed = style().dimmed();
    }
}

/// The first error hit while writing output, shared with the caller since the reporter itself is
/// handed over to the run.
#[derive(Clone, Debug, Default)]
pub(crate) struct WriteErrorSlot(Arc<Mutex<Option<io::Error>>>);

impl WriteErrorSlot {
    fn record(&self, error: io::Error) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    pub(crate) fn take(&self) -> Option<io::Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// A [`RunReporter`] that writes human-readable progress to a terminal.
#[derive(Debug)]
pub(crate) struct ConsoleReporter<W> {
    writer: W,
    styles: ReporterStyles,
    verbose: bool,
    errors: WriteErrorSlot,
}

impl<W: Write + Send + 'static> ConsoleReporter<W> {
    pub(crate) fn new(writer: W, styles: ReporterStyles, verbose: bool) -> Self {
        Self {
            writer,
            styles,
            verbose,
            errors: WriteErrorSlot::default(),
        }
    }

    pub(crate) fn errors(&self) -> WriteErrorSlot {
        self.errors.clone()
    }

    #[cfg(test)]
    pub(crate) fn into_writer(self) -> W {
        self.writer
    }

    fn write(&mut self, out: &str) {
        if let Err(error) = self
            .writer
            .write_all(out.as_bytes())
            .and_then(|()| self.writer.flush())
        {
            self.errors.record(error);
        }
    }

    fn status_line(
        &self,
        status: &str,
        status_style: Style,
        duration: Option<Duration>,
    ) -> String {
        let mut out = String::new();
        swrite!(out, "{:>12} ", status.style(status_style));
        if let Some(duration) = duration {
            swrite!(out, "[{:>9.3}s] ", duration.as_secs_f64());
        }
        out
    }
}

impl<W: Write + Send + 'static> RunReporter for ConsoleReporter<W> {
    fn started(&mut self, test: &TestHandle) {
        if self.verbose {
            let mut out = self.status_line("START", self.styles.start, None);
            swriteln!(out, "{}", test.name);
            self.write(&out);
        }
    }

    fn skipped(&mut self, test: &TestHandle) {
        let mut out = self.status_line("SKIP", self.styles.skip, None);
        swriteln!(out, "{}", test.name);
        self.write(&out);
    }

    fn passed(&mut self, test: &TestHandle, duration: Option<Duration>) {
        let mut out = self.status_line("PASS", self.styles.pass, duration);
        swriteln!(out, "{}", test.name);
        self.write(&out);
    }

    fn failed(&mut self, test: &TestHandle, failure: &TestFailure) {
        let mut out = self.status_line("FAIL", self.styles.fail, failure.duration);
        swriteln!(out, "{}", test.name);
        write_failure(&mut out, failure, &self.styles);
        self.write(&out);
    }

    fn append_output(
        &mut self,
        text: &str,
        _location: Option<&Location>,
        test: Option<&TestHandle>,
    ) {
        let prefix = test.map(|test| format!("[{}] ", test.name));
        let mut out = String::new();
        for line in text.lines() {
            match &prefix {
                Some(prefix) => swriteln!(out, "{}{line}", prefix.style(self.styles.dimmed)),
                None => swriteln!(out, "{line}"),
            }
        }
        self.write(&out);
    }
}

fn write_failure(out: &mut String, failure: &TestFailure, styles: &ReporterStyles) {
    for line in failure.message.lines() {
        swriteln!(out, "    {line}");
    }
    if let Some(location) = &failure.location {
        let file = location
            .uri
            .to_file_path()
            .ok()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| location.uri.to_string());
        // Locations are 0-based; editors count from 1.
        swriteln!(
            out,
            "    {} {file}:{}:{}",
            "at".style(styles.dimmed),
            location.line + 1,
            location.column + 1,
        );
    }
    if let Some((expected, actual)) = failure.diff() {
        swriteln!(out, "    {}", "expected:".style(styles.pass));
        for line in expected.lines() {
            swriteln!(out, "      {line}");
        }
        swriteln!(out, "    {}", "actual:".style(styles.fail));
        for line in actual.lines() {
            swriteln!(out, "      {line}");
        }
    }
}

/// Writes the final line summarizing a run.
pub(crate) fn write_summary(
    writer: &mut impl Write,
    stats: &RunStats,
    cancelled: bool,
    styles: &ReporterStyles,
) -> io::Result<()> {
    let mut out = String::new();
    let status_style = if cancelled || !stats.is_success() {
        styles.fail
    } else {
        styles.pass
    };
    swrite!(out, "{:>12} ", "Summary".style(status_style));
    swrite!(
        out,
        "{} {} run: {} passed",
        stats.started.style(styles.count),
        if stats.started == 1 { "test" } else { "tests" },
        stats.passed.style(styles.count),
    );
    if stats.failed > 0 {
        swrite!(out, ", {} {}", stats.failed.style(styles.count), "failed".style(styles.fail));
    }
    if stats.files_failed > 0 {
        swrite!(
            out,
            ", {} {} {}",
            stats.files_failed.style(styles.count),
            if stats.files_failed == 1 { "file" } else { "files" },
            "failed".style(styles.fail),
        );
    }
    if stats.skipped > 0 {
        swrite!(out, ", {} skipped", stats.skipped.style(styles.count));
    }
    if cancelled {
        swrite!(out, " ({})", "interrupted".style(styles.fail));
    }
    out.push('\n');

    writer.write_all(out.as_bytes())?;
    writer.flush()
}
