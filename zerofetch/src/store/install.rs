//! The verify-and-install protocol.
//!
//! A staged tree becomes an installed implementation only after its
//! recomputed manifest digest matches the expected digest; the final
//! rename into the store is the atomic commit. Two racing installers of
//! the same digest are serialized by the filesystem: the loser's rename
//! observes an existing target and reports [`StoreError::AlreadyInStore`],
//! which fetch callers treat as success.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::digest::ManifestDigest;
use crate::manifest;
use crate::progress::TaskHandler;

use super::protect::protect;
use super::StoreError;

/// Verify the staged tree against `expected` and move it into the store.
///
/// Takes ownership of the staging directory: on every failure path it is
/// deleted before the error is returned.
pub(crate) fn verify_and_install(
    store_root: &Path,
    staging: PathBuf,
    expected: &ManifestDigest,
    handler: &dyn TaskHandler,
) -> Result<PathBuf, StoreError> {
    match verify_and_rename(store_root, &staging, expected, handler) {
        Ok(target) => Ok(target),
        Err(e) => {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(
                    staging = %staging.display(),
                    error = %cleanup,
                    "failed to delete staging directory"
                );
            }
            Err(e)
        }
    }
}

fn verify_and_rename(
    store_root: &Path,
    staging: &Path,
    expected: &ManifestDigest,
    handler: &dyn TaskHandler,
) -> Result<PathBuf, StoreError> {
    let (format, encoded) = expected.best().ok_or(StoreError::NoKnownDigest)?;
    let expected_string = format!("{}={}", format.prefix(), encoded);

    handler.starting_manifest(&expected_string);
    let generated = manifest::generate(staging, format)?;
    generated.save(staging)?;

    let actual = generated.digest();
    if actual != expected_string {
        return Err(StoreError::DigestMismatch {
            expected: expected_string,
            actual,
            manifest: generated.serialize(),
        });
    }

    let target = store_root.join(&expected_string);
    if target.exists() {
        return Err(StoreError::AlreadyInStore {
            digest: expected_string,
        });
    }

    match fs::rename(staging, &target) {
        Ok(()) => {}
        // Lost the install race: someone else renamed first.
        Err(_) if target.exists() => {
            return Err(StoreError::AlreadyInStore {
                digest: expected_string,
            });
        }
        Err(e) => return Err(StoreError::Io(e)),
    }

    if let Err(e) = protect(&target) {
        warn!(
            target = %target.display(),
            error = %e,
            "failed to write-protect installed implementation"
        );
    }
    debug!(digest = %expected_string, "implementation installed");
    Ok(target)
}
