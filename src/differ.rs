//! Invocation of the external `xdelta3` binary-diff engine (spec.md §4.6).
//!
//! Grounded in the original tool's `run_xdelta3`, which forks and
//! `dup2()`s the patch file's fd onto stdin and the target file's fd onto
//! stdout before `execlp`. `std::process::Command` gives us the same
//! contract without hand-rolling `fork`/`dup2`.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{info, instrument};

use crate::error::SquashmergeError;

/// Runs `xdelta3 -c -d -s <scratch_path>`, feeding it `patch_body` on
/// stdin and capturing its stdout into `target`. `patch_body` must already
/// be seeked past the header and block table (spec.md §4.6: "patch-body
/// only"). stderr is inherited, matching "No stderr capture".
#[instrument(skip(patch_body, target))]
pub fn apply(scratch_path: &Path, patch_body: File, target: File) -> Result<(), SquashmergeError> {
    info!(scratch = %scratch_path.display(), "invoking xdelta3");

    let mut child = Command::new("xdelta3")
        .arg("-c")
        .arg("-d")
        .arg("-s")
        .arg(scratch_path)
        .stdin(Stdio::from(patch_body))
        .stdout(Stdio::from(target))
        .stderr(Stdio::inherit())
        .spawn()?;

    let status = child.wait()?;
    if !status.success() {
        return Err(SquashmergeError::Child(status));
    }
    Ok(())
}

/// Seeks `patch` to the start of its opaque delta payload: past the
/// sqdelta header and the block descriptor table (spec.md §6).
pub fn seek_to_patch_body(mut patch: File, header_and_table_len: u64) -> Result<File, SquashmergeError> {
    patch.seek(SeekFrom::Start(header_and_table_len))?;
    Ok(patch)
}
