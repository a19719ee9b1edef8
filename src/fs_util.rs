use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::BtcError;

/// Reads every file entry of an in-memory zip archive, keyed by its
/// `/`-separated path. Directory entries are skipped.
pub fn read_zip_entries(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, BtcError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| BtcError::Archive(err.to_string()))?;

    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| BtcError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        if entry.enclosed_name().is_none() {
            return Err(BtcError::Archive(
                "zip entry path traversal detected".to_string(),
            ));
        }
        let name = entry.name().replace('\\', "/");
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|err| BtcError::Archive(format!("read {name}: {err}")))?;
        entries.insert(name, data);
    }
    Ok(entries)
}

/// Accumulates files into an in-memory, deflate-compressed zip.
pub struct ZipBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    files: usize,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            files: 0,
        }
    }

    pub fn add_file(&mut self, name: &str, content: &[u8]) -> Result<(), BtcError> {
        self.writer
            .start_file(name, self.options)
            .map_err(|err| BtcError::Archive(err.to_string()))?;
        self.writer
            .write_all(content)
            .map_err(|err| BtcError::Archive(format!("write {name}: {err}")))?;
        self.files += 1;
        Ok(())
    }

    pub fn file_count(&self) -> usize {
        self.files
    }

    pub fn finish(self) -> Result<Vec<u8>, BtcError> {
        let cursor = self
            .writer
            .finish()
            .map_err(|err| BtcError::Archive(err.to_string()))?;
        Ok(cursor.into_inner())
    }
}

impl Default for ZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}
