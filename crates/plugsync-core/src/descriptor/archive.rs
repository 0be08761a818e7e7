//! Zip archive descriptor reader.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;

use super::{Descriptor, DescriptorParser};
use crate::{Result, SyncError};

pub const DESCRIPTOR_ENTRY: &str = "META-INF/plugin.toml";
pub const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

/// Reads `META-INF/plugin.toml` from a zip archive. When the descriptor has
/// no version, `Implementation-Version` from the manifest is used instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveDescriptorParser;

impl ArchiveDescriptorParser {
    pub fn new() -> Self {
        Self
    }
}

impl DescriptorParser for ArchiveDescriptorParser {
    fn parse(&self, path: &Path) -> Result<Descriptor> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file).map_err(|e| SyncError::corrupt(path, e))?;

        let content = match read_entry(&mut archive, DESCRIPTOR_ENTRY) {
            Ok(Some(content)) => content,
            Ok(None) => {
                return Err(SyncError::corrupt(
                    path,
                    format!("missing {DESCRIPTOR_ENTRY}"),
                ));
            }
            Err(e) => return Err(SyncError::corrupt(path, e)),
        };

        let mut descriptor =
            Descriptor::from_toml(&content).map_err(|e| SyncError::corrupt(path, e))?;

        if descriptor.version.is_none() {
            descriptor.version = read_entry(&mut archive, MANIFEST_ENTRY)
                .ok()
                .flatten()
                .and_then(|manifest| implementation_version(&manifest));
            if let Some(version) = &descriptor.version {
                debug!(
                    "Using manifest version {} for {}",
                    version,
                    path.display()
                );
            }
        }

        Ok(descriptor)
    }
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> std::result::Result<Option<String>, ZipError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(Some(content))
}

fn implementation_version(manifest: &str) -> Option<String> {
    manifest.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("Implementation-Version") {
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Build an artifact archive in memory: the descriptor plus any extra
/// entries. Entry timestamps are fixed so equal input yields equal bytes.
pub fn pack_archive(descriptor: &Descriptor, extra: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    pack_raw(&descriptor.to_toml(), extra)
}

pub(crate) fn pack_raw(descriptor_toml: &str, extra: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default());

    let to_err = |e: ZipError| SyncError::corrupt(DESCRIPTOR_ENTRY, e);

    zip.start_file(DESCRIPTOR_ENTRY, options).map_err(to_err)?;
    zip.write_all(descriptor_toml.as_bytes())?;
    for (name, bytes) in extra {
        zip.start_file(*name, options).map_err(to_err)?;
        zip.write_all(bytes)?;
    }
    let cursor = zip.finish().map_err(to_err)?;
    Ok(cursor.into_inner())
}
