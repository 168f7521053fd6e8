//! ZIP packaging of a synced site directory.

use crate::utils::{BackupError, Result};
use chrono::{Datelike, Local, Timelike};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Outcome of a successful archive run.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    /// Number of file and directory entries written
    pub entries: usize,
    /// Size of the archive on disk
    pub bytes: u64,
}

/// Creates a ZIP archive at `archive_path` holding everything below `source_dir`.
///
/// Entry names are relative to the parent of `source_dir`, so extracting the
/// archive recreates a directory named after `source_dir`. The source root
/// itself gets no entry. Directories (including empty ones) get their own
/// `name/` entry. File entries carry ZIP64 headers, so files of 4 GiB and
/// more are stored like any other.
///
/// On failure the partially written archive is left where it is.
pub fn create_zip_archive(archive_path: &Path, source_dir: &Path) -> Result<ArchiveSummary> {
    if !source_dir.is_dir() {
        return Err(BackupError::resource(
            format!("archive source {} is not a directory", source_dir.display()),
            io::Error::new(io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let base = source_dir.parent().unwrap_or_else(|| Path::new(""));

    info!(
        source = %source_dir.display(),
        archive = %archive_path.display(),
        "Creating ZIP archive"
    );

    let file = File::create(archive_path).map_err(|e| {
        BackupError::resource(
            format!("failed to create archive file {}", archive_path.display()),
            e,
        )
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let mut entries = 0;

    let walker = WalkDir::new(source_dir).min_depth(1).sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| {
            let context = format!("failed to walk {}", source_dir.display());
            BackupError::resource(context, io::Error::from(e))
        })?;
        let path = entry.path();
        let name = entry_name(path, base)?;
        let options = entry_options(&entry);

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
        } else {
            let mut source = File::open(path).map_err(|e| {
                BackupError::resource(format!("failed to open {}", path.display()), e)
            })?;
            zip.start_file(name.as_str(), options)?;
            io::copy(&mut source, &mut zip).map_err(|e| {
                BackupError::resource(format!("failed to add {} to archive", path.display()), e)
            })?;
        }
        debug!(entry = %name, "Added archive entry");
        entries += 1;
    }

    let writer = zip.finish()?;
    let file = writer.into_inner().map_err(|e| {
        BackupError::resource(
            format!("failed to flush archive {}", archive_path.display()),
            e.into_error(),
        )
    })?;
    let bytes = file
        .metadata()
        .map_err(|e| {
            BackupError::resource(format!("failed to stat {}", archive_path.display()), e)
        })?
        .len();

    info!(archive = %archive_path.display(), entries, bytes, "ZIP archive created");
    Ok(ArchiveSummary {
        path: archive_path.to_path_buf(),
        entries,
        bytes,
    })
}

/// POSIX-style name of `path` relative to `base`.
fn entry_name(path: &Path, base: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        BackupError::resource(
            format!("{} is outside {}", path.display(), base.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "path outside archive root"),
        )
    })?;

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

fn entry_options(entry: &walkdir::DirEntry) -> SimpleFileOptions {
    let mut options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(entry.file_type().is_file());

    let Ok(metadata) = entry.metadata() else {
        return options;
    };
    if let Some(modified) = metadata.modified().ok().and_then(zip_time) {
        options = options.last_modified_time(modified);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode() & 0o7777);
    }

    options
}

/// Local wall-clock time as stored in ZIP headers. `None` outside 1980..=2107.
fn zip_time(time: SystemTime) -> Option<zip::DateTime> {
    let local = chrono::DateTime::<Local>::from(time);
    let year = u16::try_from(local.year()).ok()?;
    zip::DateTime::from_date_and_time(
        year,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}
