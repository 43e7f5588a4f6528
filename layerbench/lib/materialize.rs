use std::path::Path;

use tempfile::TempDir;

use crate::{archive, FilesystemDelta, LayerInit, LayerbenchResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const EXPECTED_DIR_PREFIX: &str = "check-layer-";

const TAR_DIR_PREFIX: &str = "tar-";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Flattens a chain of layer initializers into a fresh scratch directory.
///
/// Every delta of every initializer is applied, in order, onto the same directory. The result is the
/// filesystem a correct layer store must show when the whole chain is mounted. The directory is
/// removed when the returned [`TempDir`] is dropped.
///
/// ## Errors
///
/// Returns an error if the scratch directory cannot be created or a delta fails to apply.
pub fn materialize(inits: &[LayerInit]) -> LayerbenchResult<TempDir> {
    let dir = tempfile::Builder::new()
        .prefix(EXPECTED_DIR_PREFIX)
        .tempdir()?;

    materialize_into(dir.path(), inits)?;
    Ok(dir)
}

/// Applies every delta of every initializer, in order, onto `root`.
pub fn materialize_into(root: impl AsRef<Path>, inits: &[LayerInit]) -> LayerbenchResult<()> {
    let root = root.as_ref();
    for init in inits {
        init.apply(root)?;
    }

    tracing::debug!(
        "Materialized {} layer initializers into {}",
        inits.len(),
        root.display()
    );

    Ok(())
}

/// Applies `deltas` to an empty directory and archives the result.
///
/// The archive is produced by the same deterministic codec a layer store uses for diff streams, so a
/// single-layer store diff of the same deltas must match it byte for byte.
pub fn tar_from_deltas(deltas: &[FilesystemDelta]) -> LayerbenchResult<Vec<u8>> {
    let dir = tempfile::Builder::new().prefix(TAR_DIR_PREFIX).tempdir()?;
    for delta in deltas {
        delta.apply(dir.path())?;
    }

    Ok(archive::pack_directory(dir.path())?)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{make_directory, manifest::DirectoryManifest, remove_subtree, rename, write_file};

    #[test_log::test]
    fn test_materialize_applies_layers_in_order() -> anyhow::Result<()> {
        let inits = vec![
            LayerInit::new(vec![
                make_directory("/etc", 0o755),
                write_file("/etc/hosts", "mydomain 10.0.0.1", 0o644),
                write_file("/etc/profile", "PATH=/usr/bin", 0o644),
            ]),
            LayerInit::new(vec![
                write_file("/etc/hosts", "mydomain 10.0.0.2", 0o644),
                remove_subtree("/etc/profile"),
                rename("/etc/hosts", "/etc/hosts.new"),
            ]),
        ];

        let dir = materialize(&inits)?;
        assert!(dir
            .path()
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(EXPECTED_DIR_PREFIX)));
        assert!(!dir.path().join("etc/profile").exists());
        assert!(!dir.path().join("etc/hosts").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/hosts.new"))?,
            "mydomain 10.0.0.2"
        );

        Ok(())
    }

    #[test_log::test]
    fn test_materialize_reports_failing_delta() -> anyhow::Result<()> {
        let inits = vec![LayerInit::new(vec![rename("/missing", "/other")])];
        let err = materialize(&inits).unwrap_err();
        assert!(err.to_string().contains("rename /missing to /other"));

        Ok(())
    }

    #[test_log::test]
    fn test_tar_from_deltas_is_deterministic() -> anyhow::Result<()> {
        let deltas = [
            make_directory("/etc", 0o755),
            write_file("/etc/hosts", "mydomain 10.0.0.1", 0o644),
        ];

        let first = tar_from_deltas(&deltas)?;
        let second = tar_from_deltas(&deltas)?;
        assert_eq!(first, second);

        let dest = tempfile::tempdir()?;
        archive::unpack(&first[..], dest.path())?;
        let expected = materialize(&[LayerInit::new(deltas.to_vec())])?;
        assert_eq!(
            DirectoryManifest::build(dest.path())?,
            DirectoryManifest::build(expected.path())?
        );

        Ok(())
    }
}
