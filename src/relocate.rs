//! Volume relocation
//!
//! The directory file embeds the block-file locations, so a plain
//! filesystem `mv` leaves a volume pointing at its old home. These
//! operations move or copy the files and rewrite the path table; the
//! index entries and block data are never touched.

use crate::error::{Error, Result};
use crate::header;
use futures::future::try_join_all;
use std::path::{Path, PathBuf};
use tokio::fs;

fn path_to_string(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| Error::Format(format!("non-UTF-8 path: {}", path.display())))
}

fn file_name(recorded: &str) -> Result<&std::ffi::OsStr> {
    Path::new(recorded)
        .file_name()
        .ok_or_else(|| Error::Format(format!("path table entry has no file name: {}", recorded)))
}

/// Rewrite the path table so every block file is expected beside the
/// directory file, wherever it currently lives.
///
/// Run this after moving a volume's files by hand; the block data is
/// not opened, so it also works while the block files are still in
/// transit.
pub async fn rebase(dir_file: impl AsRef<Path>) -> Result<()> {
    let dir_file = dir_file.as_ref();
    let mut parsed = header::load(dir_file).await?;

    let parent = dir_file.parent().unwrap_or_else(|| Path::new("."));
    let mut rebased = Vec::with_capacity(parsed.header.block_paths.len());
    for recorded in &parsed.header.block_paths {
        rebased.push(path_to_string(&parent.join(file_name(recorded)?))?);
    }
    parsed.header.block_paths = rebased;

    header::persist(dir_file, &parsed.header, &parsed.index).await?;
    tracing::info!(path = %dir_file.display(), "rebased path table");
    Ok(())
}

async fn relocate(src: &Path, dest_dir: &Path, move_files: bool) -> Result<PathBuf> {
    let parsed = header::load(src).await?;

    fs::create_dir_all(dest_dir).await?;
    let dest_file = dest_dir.join(
        src.file_name()
            .ok_or_else(|| Error::Format(format!("no file name in {}", src.display())))?,
    );
    if fs::try_exists(&dest_file).await? {
        return Err(Error::AlreadyExists(dest_file));
    }

    // Block files move concurrently; each is independent of the rest.
    let mut header = parsed.header;
    let transfers = header.block_paths.iter().map(|recorded| async move {
        let dest = dest_dir.join(file_name(recorded)?);
        if move_files {
            fs::rename(recorded, &dest).await?;
        } else {
            fs::copy(recorded, &dest).await?;
        }
        path_to_string(&dest)
    });
    let dest_paths = try_join_all(transfers).await?;
    header.block_paths = dest_paths;

    header::persist(&dest_file, &header, &parsed.index).await?;
    if move_files {
        fs::remove_file(src).await?;
    }
    tracing::info!(
        from = %src.display(),
        to = %dest_file.display(),
        moved = move_files,
        "relocated volume"
    );
    Ok(dest_file)
}

/// Move a volume - directory file plus block files - into `dest_dir`
/// (created if missing) and point the path table there. Returns the new
/// directory-file path.
pub async fn move_volume(
    src_dir_file: impl AsRef<Path>,
    dest_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    relocate(src_dir_file.as_ref(), dest_dir.as_ref(), true).await
}

/// Copy a volume into `dest_dir`, leaving the source intact. Returns
/// the new directory-file path.
pub async fn copy_volume(
    src_dir_file: impl AsRef<Path>,
    dest_dir: impl AsRef<Path>,
) -> Result<PathBuf> {
    relocate(src_dir_file.as_ref(), dest_dir.as_ref(), false).await
}
