use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    AddResult, DownloadResult, ExportResult, ImportResult, PanelResult, ProgressEvent,
    ProgressSink, RemoveResult, SeedResult,
};
use crate::domain::ResourceMetadata;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

impl OutputMode {
    pub fn sink(self) -> &'static dyn ProgressSink {
        match self {
            OutputMode::Interactive => &StderrProgress,
            OutputMode::NonInteractive => &JsonOutput,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_workspace(workspace: &Workspace) -> io::Result<()> {
        Self::print_json(workspace)
    }

    pub fn print_metadata(metadata: &ResourceMetadata) -> io::Result<()> {
        Self::print_json(metadata)
    }

    pub fn print_add(result: &AddResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_remove(result: &RemoveResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_panels(result: &PanelResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_import(result: &ImportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_download(result: &DownloadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_seed(result: &SeedResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// One line per progress event on stderr, keeping stdout for JSON.
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(stderr, "{} ({} ms)", event.message, elapsed.as_millis()),
            None => writeln!(stderr, "{}", event.message),
        };
    }
}
