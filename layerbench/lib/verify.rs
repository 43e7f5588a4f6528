use std::io::Read;

use crate::{
    store::{layer_ancestry, Digest, Layer, LayerStore, ReleaseMetadata},
    LayerbenchError, LayerbenchResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Byte diffs longer than this are summarized instead of printed.
pub const MAX_BYTE_LOG: usize = 4 * 1024;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that the diff stream of `layer` is exactly `expected`.
///
/// The digest of `expected` is first compared with the layer's diff ID, then the full diff stream
/// is read and compared by length and by digest.
///
/// ## Errors
///
/// Returns [`LayerbenchError::LayerDiffMismatch`] describing the first divergence, with the offset
/// of the first differing byte and a bounded excerpt of the remaining bytes.
pub fn check_layer_diff(expected: &[u8], layer: &impl Layer) -> LayerbenchResult<()> {
    let expected_digest = Digest::from_bytes(expected);
    if layer.diff_id().digest() != &expected_digest {
        return Err(LayerbenchError::LayerDiffMismatch(format!(
            "mismatched diff id for {}, got {}, expected {}",
            layer.chain_id(),
            layer.diff_id(),
            expected_digest
        )));
    }

    let mut actual = Vec::new();
    layer
        .tar_stream()
        .map_err(|e| LayerbenchError::store("get tar stream", e))?
        .read_to_end(&mut actual)?;

    if actual.len() != expected.len() {
        return Err(LayerbenchError::LayerDiffMismatch(format!(
            "mismatched tar stream size for {}, got {}, expected {}, {}",
            layer.chain_id(),
            actual.len(),
            expected.len(),
            byte_diff_message(&actual, expected)
        )));
    }

    let actual_digest = Digest::from_bytes(&actual);
    if actual_digest != expected_digest {
        return Err(LayerbenchError::LayerDiffMismatch(format!(
            "wrong digest of tar stream, got {}, expected {}, {}",
            actual_digest,
            expected_digest,
            byte_diff_message(&actual, expected)
        )));
    }

    Ok(())
}

/// Checks that two layers are the same, comparing chain ID, diff ID and size up the whole parent
/// chain.
///
/// ## Errors
///
/// Returns [`LayerbenchError::LayerMismatch`] at the first divergence, including one chain ending
/// before the other.
pub fn check_same_layer(a: &impl Layer, b: &impl Layer) -> LayerbenchResult<()> {
    let mut depth = 0;
    let mut pair = (Some(a), Some(b));

    loop {
        let (a, b) = match pair {
            (None, None) => return Ok(()),
            (Some(a), Some(b)) => (a, b),
            (a, b) => {
                return Err(LayerbenchError::LayerMismatch(format!(
                    "mismatched parents at depth {depth}: {} vs {}",
                    a.map_or_else(|| "none".to_string(), |l| l.chain_id().to_string()),
                    b.map_or_else(|| "none".to_string(), |l| l.chain_id().to_string()),
                )));
            }
        };

        if a.chain_id() != b.chain_id() {
            return Err(LayerbenchError::LayerMismatch(format!(
                "mismatched ID: {} vs {}",
                a.chain_id(),
                b.chain_id()
            )));
        }

        if a.diff_id() != b.diff_id() {
            return Err(LayerbenchError::LayerMismatch(format!(
                "mismatched DiffID: {} vs {}",
                a.diff_id(),
                b.diff_id()
            )));
        }

        let size_a = a
            .size()
            .map_err(|e| LayerbenchError::store("get layer size", e))?;
        let size_b = b
            .size()
            .map_err(|e| LayerbenchError::store("get layer size", e))?;
        if size_a != size_b {
            return Err(LayerbenchError::LayerMismatch(format!(
                "mismatched size: {size_a} vs {size_b}"
            )));
        }

        pair = (a.parent(), b.parent());
        depth += 1;
    }
}

/// Returns the bytes of `a` and `b` that follow their common prefix.
pub fn byte_diff<'a, 'b>(a: &'a [u8], b: &'b [u8]) -> (&'a [u8], &'b [u8]) {
    let common = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    (&a[common..], &b[common..])
}

/// Describes where `actual` starts to differ from `expected`.
///
/// Returns an empty string if the two are equal. Diffs longer than [`MAX_BYTE_LOG`] only report the
/// length of the common prefix.
pub fn byte_diff_message(actual: &[u8], expected: &[u8]) -> String {
    let (d1, d2) = byte_diff(actual, expected);
    if d1.is_empty() && d2.is_empty() {
        return String::new();
    }

    let prefix = actual.len() - d1.len();
    if d1.len() > MAX_BYTE_LOG || d2.len() > MAX_BYTE_LOG {
        return format!("byte diff after {prefix} matching bytes");
    }

    format!(
        "byte diff after {prefix} matching bytes {}, expected {}",
        hex::encode(d1),
        hex::encode(d2)
    )
}

/// Collects the release metadata the store reports when `layers` are deleted, in the given order.
pub fn create_metadata<L: Layer>(layers: &[&L]) -> LayerbenchResult<Vec<ReleaseMetadata>> {
    layers
        .iter()
        .map(|layer| {
            Ok(ReleaseMetadata {
                chain_id: layer.chain_id().clone(),
                diff_id: layer.diff_id().clone(),
                size: layer
                    .size()
                    .map_err(|e| LayerbenchError::store("get layer size", e))?,
                diff_size: layer
                    .diff_size()
                    .map_err(|e| LayerbenchError::store("get layer diff size", e))?,
            })
        })
        .collect()
}

/// Collects the release metadata of `layer` and all of its ancestors, tip first.
pub fn chain_metadata(layer: &impl Layer) -> LayerbenchResult<Vec<ReleaseMetadata>> {
    create_metadata(&layer_ancestry(layer))
}

/// Checks that the metadata a store reported on release is exactly `expected`.
///
/// ## Errors
///
/// Returns [`LayerbenchError::MetadataMismatch`] listing every divergence: a count mismatch, every
/// differing position, and every unexpected or missing entry.
pub fn check_metadata(
    actual: &[ReleaseMetadata],
    expected: &[ReleaseMetadata],
) -> LayerbenchResult<()> {
    let mut mismatches = Vec::new();
    if actual.len() != expected.len() {
        mismatches.push(format!(
            "unexpected number of deletes {}, expected {}",
            actual.len(),
            expected.len()
        ));
    }

    for i in 0..actual.len().max(expected.len()) {
        match (actual.get(i), expected.get(i)) {
            (Some(a), Some(e)) if a != e => mismatches.push(format!(
                "position {i}: unexpected metadata {a:?}, expected {e:?}"
            )),
            (Some(a), None) => mismatches.push(format!("position {i}: unexpected delete {a:?}")),
            (None, Some(e)) => mismatches.push(format!("position {i}: missing delete {e:?}")),
            _ => {}
        }
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(LayerbenchError::MetadataMismatch(mismatches))
    }
}

/// Releases `layer` and checks that exactly the layers described by `expected` were deleted.
pub fn release_and_check_deleted<S: LayerStore>(
    store: &mut S,
    layer: S::Layer,
    expected: &[ReleaseMetadata],
) -> LayerbenchResult<()> {
    let actual = store
        .release(layer)
        .map_err(|e| LayerbenchError::store("release layer", e))?;

    check_metadata(&actual, expected)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::tempdir;

    use super::*;
    use crate::{
        build_layer, implementations::VfsLayerStore, tar_from_deltas, write_file, LayerInit,
    };

    #[test]
    fn test_byte_diff_after_common_prefix() {
        assert_eq!(byte_diff(b"abcdef", b"abcxyz"), (&b"def"[..], &b"xyz"[..]));
        assert_eq!(byte_diff(b"abc", b"abcd"), (&b""[..], &b"d"[..]));
        assert_eq!(byte_diff_message(b"same", b"same"), "");
        assert_eq!(
            byte_diff_message(b"ab\x01", b"ab\x02"),
            "byte diff after 2 matching bytes 01, expected 02"
        );

        let long = vec![1u8; MAX_BYTE_LOG + 1];
        assert_eq!(
            byte_diff_message(&long, b""),
            "byte diff after 0 matching bytes"
        );
    }

    #[test_log::test]
    fn test_check_layer_diff_detects_mismatch() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut store = VfsLayerStore::new(dir.path())?;
        let deltas = [write_file("/a", "a", 0o644)];

        let tar = tar_from_deltas(&deltas)?;
        let layer = store.register(Cursor::new(&tar), None)?;
        check_layer_diff(&tar, &layer)?;

        let other = tar_from_deltas(&[write_file("/a", "b", 0o644)])?;
        let err = check_layer_diff(&other, &layer).unwrap_err();
        assert!(err.to_string().contains("mismatched diff id"));

        store.release(layer)?;

        Ok(())
    }

    #[test_log::test]
    fn test_check_same_layer_compares_ancestry() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut store = VfsLayerStore::new(dir.path())?;
        let init = LayerInit::new(vec![write_file("/a", "a", 0o644)]);

        let first = build_layer(&mut store, None, &init)?;
        let second = build_layer(&mut store, None, &init)?;
        check_same_layer(&first, &second)?;

        let child = build_layer(&mut store, Some(first.chain_id()), &init)?;
        let err = check_same_layer(&child, &first).unwrap_err();
        assert!(err.to_string().contains("mismatched ID"));

        for layer in [child, second, first] {
            store.release(layer)?;
        }

        Ok(())
    }

    #[test_log::test]
    fn test_release_and_check_deleted_reports_every_divergence() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let mut store = VfsLayerStore::new(dir.path())?;

        let base_init = LayerInit::new(vec![write_file("/a", "a", 0o644)]);
        let base = build_layer(&mut store, None, &base_init)?;
        let tip = build_layer(
            &mut store,
            Some(base.chain_id()),
            &LayerInit::new(vec![write_file("/b", "b", 0o644)]),
        )?;
        store.release(base)?;

        let expected = chain_metadata(&tip)?;
        assert_eq!(expected.len(), 2);

        let err = check_metadata(&expected[..1], &expected[1..]).unwrap_err();
        assert!(matches!(&err, LayerbenchError::MetadataMismatch(entries) if entries.len() == 1));

        let err = check_metadata(&expected[..1], &[]).unwrap_err();
        assert!(matches!(&err, LayerbenchError::MetadataMismatch(entries) if entries.len() == 2));

        release_and_check_deleted(&mut store, tip, &expected)?;

        Ok(())
    }

    #[test]
    fn test_check_layer_diff_reports_stream_divergence() {
        let expected = b"abc";

        let longer = helper::FakeLayer::new("tip", expected, b"abcde".to_vec());
        let err = check_layer_diff(expected, &longer).unwrap_err().to_string();
        assert!(err.contains("mismatched tar stream size"), "{err}");
        assert!(err.contains("got 5, expected 3"), "{err}");
        assert!(err.contains("byte diff after 3 matching bytes 6465, expected "), "{err}");

        let altered = helper::FakeLayer::new("tip", expected, b"abd".to_vec());
        let err = check_layer_diff(expected, &altered).unwrap_err().to_string();
        assert!(err.contains("wrong digest of tar stream"), "{err}");
        assert!(err.contains("byte diff after 2 matching bytes 64, expected 63"), "{err}");

        let expected = vec![0u8; MAX_BYTE_LOG + 8];
        let mut stream = expected.clone();
        stream[1..].fill(1);
        let large = helper::FakeLayer::new("tip", &expected, stream);
        let err = check_layer_diff(&expected, &large).unwrap_err();
        assert!(matches!(err, LayerbenchError::LayerDiffMismatch(_)));
        assert!(err.to_string().ends_with("byte diff after 1 matching bytes"), "{err}");
    }

    #[test]
    fn test_check_same_layer_reports_size_and_parent_divergence() {
        let small = helper::FakeLayer::new("layer", b"diff", Vec::new()).with_size(1);
        let big = helper::FakeLayer::new("layer", b"diff", Vec::new()).with_size(2);
        let err = check_same_layer(&small, &big).unwrap_err().to_string();
        assert!(err.contains("mismatched size: 1 vs 2"), "{err}");

        let base = helper::FakeLayer::new("base", b"base", Vec::new());
        let base_id = base.chain_id().clone();
        let child = helper::FakeLayer::new("child", b"child", Vec::new()).with_parent(base);
        let orphan = helper::FakeLayer::new("child", b"child", Vec::new());

        let err = check_same_layer(&child, &orphan).unwrap_err();
        assert!(matches!(err, LayerbenchError::LayerMismatch(_)));
        assert!(
            err.to_string()
                .contains(&format!("mismatched parents at depth 1: {base_id} vs none")),
            "{err}"
        );

        let err = check_same_layer(&orphan, &child).unwrap_err().to_string();
        assert!(err.contains(&format!("at depth 1: none vs {base_id}")), "{err}");
    }

    mod helper {
        use std::io::Cursor;

        use crate::store::{ChainId, DiffId, Layer, StoreResult};

        /// A layer with fixed identifiers, size and diff stream.
        pub(super) struct FakeLayer {
            chain_id: ChainId,
            diff_id: DiffId,
            size: u64,
            stream: Vec<u8>,
            parent: Option<Box<FakeLayer>>,
        }

        impl FakeLayer {
            pub(super) fn new(name: &str, diff: &[u8], stream: Vec<u8>) -> Self {
                let diff_id = DiffId::from_bytes(diff);
                Self {
                    chain_id: ChainId::derive(None, &DiffId::from_bytes(name)),
                    diff_id,
                    size: 0,
                    stream,
                    parent: None,
                }
            }

            pub(super) fn with_size(mut self, size: u64) -> Self {
                self.size = size;
                self
            }

            pub(super) fn with_parent(mut self, parent: FakeLayer) -> Self {
                self.parent = Some(Box::new(parent));
                self
            }
        }

        impl Layer for FakeLayer {
            fn chain_id(&self) -> &ChainId {
                &self.chain_id
            }

            fn diff_id(&self) -> &DiffId {
                &self.diff_id
            }

            fn size(&self) -> StoreResult<u64> {
                Ok(self.size)
            }

            fn diff_size(&self) -> StoreResult<u64> {
                Ok(self.stream.len() as u64)
            }

            fn parent(&self) -> Option<&Self> {
                self.parent.as_deref()
            }

            fn tar_stream(&self) -> StoreResult<Box<dyn std::io::Read + '_>> {
                Ok(Box::new(Cursor::new(&self.stream)))
            }
        }
    }
}
