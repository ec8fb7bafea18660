//! Recursive listing of a Source, for `datascanner explore`.

use datascanner_engine::{Engine, Result, SourceManager, SourceRef};
use std::io::Write;
use std::sync::Arc;
use tracing::warn;

/// Writes every Handle below `source`, descending into containers, one per
/// line and indented by derivation depth. Returns the number of leaves.
pub fn write_tree<W: Write>(engine: &Engine, source: &SourceRef, sm: &mut SourceManager, out: &mut W) -> Result<usize> {
    let mut leaves = 0;
    for handle in Arc::clone(source).handles(sm)? {
        let indent = "  ".repeat(source.depth());
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                writeln!(out, "{}! {}", indent, err)?;
                continue;
            }
        };
        writeln!(out, "{}{}", indent, handle.relative_path())?;
        let derived = match engine.sources.from_handle(&handle, Some(&mut *sm)) {
            Ok(derived) => derived,
            Err(err) => {
                warn!(handle = %handle, error = %err, "Could not inspect handle");
                None
            }
        };
        leaves += match derived {
            Some(inner) => write_tree(engine, &inner, sm, out)?,
            None => 1,
        };
    }
    Ok(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;
    use ::zip::write::{FileOptions, ZipWriter};

    #[test]
    fn test_tree_descends_into_archives() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        let mut zip = ZipWriter::new(File::create(tmp.path().join("b.zip")).unwrap());
        zip.start_file("inner/c.txt", FileOptions::default()).unwrap();
        zip.write_all(b"c").unwrap();
        zip.finish().unwrap();

        let engine = Engine::builtin().unwrap();
        let url = format!("file://{}", tmp.path().display());
        let source = engine.sources.from_url(&url).unwrap();
        let mut sm = SourceManager::new();
        let mut out = Vec::new();
        let leaves = write_tree(&engine, &source, &mut sm, &mut out).unwrap();

        assert_eq!(leaves, 2);
        assert_eq!(String::from_utf8(out).unwrap(), "a.txt\nb.zip\n  inner/c.txt\n");
    }
}
