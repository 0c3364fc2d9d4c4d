//! On-disk saved state.

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Load a JSON state file; `Ok(None)` if it does not exist.
pub(crate) fn load_optional<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>> {
    let f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Opening {path}")),
    };
    let bufr = std::io::BufReader::new(f);
    let v = serde_json::from_reader(bufr).with_context(|| format!("Parsing {path}"))?;
    Ok(Some(v))
}

/// Atomically replace the on-disk state with a new version.
pub(crate) fn write_atomic<T: Serialize>(path: &Utf8Path, state: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
    let tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp file")?;
    {
        let mut buff = std::io::BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut buff, state)?;
        buff.write_all(b"\n")?;
        buff.flush()?;
    }
    tmp.as_file().sync_all().context("syncing")?;
    tmp.persist(path)
        .with_context(|| format!("Renaming temp file to {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_write_and_load() {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let path = dir.join("nested/state.json");
        assert!(load_optional::<BTreeMap<String, u32>>(&path)
            .unwrap()
            .is_none());
        let mut m = BTreeMap::new();
        m.insert("a".to_string(), 1u32);
        write_atomic(&path, &m).unwrap();
        m.insert("b".to_string(), 2);
        write_atomic(&path, &m).unwrap();
        let loaded: BTreeMap<String, u32> = load_optional(&path).unwrap().unwrap();
        assert_eq!(loaded, m);
        // Only the final file remains; no temp files are left behind
        assert_eq!(std::fs::read_dir(dir.join("nested")).unwrap().count(), 1);
    }
}
