use std::path::Path;

use crate::{
    manifest::DirectoryManifest, materialize, store::ChainId, LayerInit, LayerStore,
    LayerbenchError, LayerbenchResult, MountSession,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that the mounted view of `chain_id` matches the flattened content of `inits`.
///
/// The expected tree is materialized into a scratch directory, the chain is mounted through a
/// transient RW layer, and both trees are compared with [`check_directory_equal`]. The transient
/// layer is unmounted and released whatever the outcome of the comparison.
///
/// ## Errors
///
/// Returns [`LayerbenchError::DirectoryMismatch`] listing every differing path if the trees differ.
/// A comparison failure takes precedence over a failure to clean up, which is only logged.
pub fn check_layer<S: LayerStore>(
    store: &mut S,
    chain_id: &ChainId,
    inits: &[LayerInit],
) -> LayerbenchResult<()> {
    let expected = materialize(inits)?;

    let mut session = MountSession::create(store, Some(chain_id))?;
    let actual = session.mount()?;

    let compared = check_directory_equal(&actual, expected.path());
    let closed = session.close();

    match (compared, closed) {
        (Err(e), Err(close_err)) => {
            tracing::warn!("Failed to close session after layer check failure: {}", close_err);
            Err(e)
        }
        (Err(e), Ok(_)) => Err(e),
        (Ok(()), closed) => closed.map(|_| ()),
    }
}

/// Checks that two directory trees are structurally identical.
///
/// Type, permission bits, ownership, content digest, symlink target, device number and hardlink
/// group are compared for every path. Timestamps and the roots themselves are ignored.
pub fn check_directory_equal(
    actual: impl AsRef<Path>,
    expected: impl AsRef<Path>,
) -> LayerbenchResult<()> {
    let actual = actual.as_ref();
    let expected = expected.as_ref();

    let actual_manifest = DirectoryManifest::build(actual)?;
    let expected_manifest = DirectoryManifest::build(expected)?;

    let diff = expected_manifest.diff(&actual_manifest);
    if diff.is_empty() {
        return Ok(());
    }

    tracing::debug!(
        "{} paths differ between {} and {}",
        diff.len(),
        actual.display(),
        expected.display()
    );

    Err(LayerbenchError::DirectoryMismatch {
        actual: actual.to_path_buf(),
        expected: expected.to_path_buf(),
        diff,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::symlink};

    use tempfile::tempdir;

    use super::*;
    use crate::{
        build_chain, implementations::VfsLayerStore, make_directory, materialize_into, write_file,
        Layer,
    };

    #[test_log::test]
    fn test_check_directory_equal_reports_every_path() -> anyhow::Result<()> {
        let actual = tempdir()?;
        let expected = tempdir()?;

        let init = LayerInit::new(vec![
            make_directory("/etc", 0o755),
            write_file("/etc/hosts", "mydomain 10.0.0.1", 0o644),
            write_file("/etc/profile", "PATH=/usr/bin", 0o644),
        ]);
        materialize_into(actual.path(), &[init.clone()])?;
        materialize_into(expected.path(), &[init])?;
        check_directory_equal(actual.path(), expected.path())?;

        fs::write(actual.path().join("etc/hosts"), "mydomain 10.0.0.2")?;
        fs::remove_file(actual.path().join("etc/profile"))?;
        symlink("hosts", actual.path().join("etc/extra"))?;

        let err = check_directory_equal(actual.path(), expected.path()).unwrap_err();
        let LayerbenchError::DirectoryMismatch { diff, .. } = &err else {
            anyhow::bail!("expected a directory mismatch, got {err}");
        };

        assert_eq!(diff.paths(), vec!["/etc/extra", "/etc/hosts", "/etc/profile"]);
        assert_eq!(diff.get_added(), &vec!["/etc/extra".to_string()]);
        assert_eq!(diff.get_deleted(), &vec!["/etc/profile".to_string()]);
        assert!(err.is_mismatch());

        Ok(())
    }

    #[test_log::test]
    fn test_check_layer_releases_transient_session() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut store = VfsLayerStore::new(dir.path())?;
        let inits = vec![LayerInit::new(vec![write_file("/a", "a", 0o644)])];

        let layer = build_chain(&mut store, &inits)?;
        check_layer(&mut store, layer.chain_id(), &inits)?;
        assert_eq!(store.reference_count(layer.chain_id()), Some(1));

        let wrong = vec![LayerInit::new(vec![write_file("/a", "b", 0o644)])];
        let err = check_layer(&mut store, layer.chain_id(), &wrong).unwrap_err();
        assert!(err.is_mismatch());
        assert_eq!(store.reference_count(layer.chain_id()), Some(1));
        assert_eq!(fs::read_dir(dir.path().join("mounts"))?.count(), 0);

        store.release(layer)?;

        Ok(())
    }
}
