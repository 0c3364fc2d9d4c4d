//! SSH client configuration stanzas for provisioned machines.
//!
//! Each run owns exactly one `Host <alias>` block in the per-prefix host file.
//! Writing an entry replaces any existing block for the same alias and leaves
//! everything else in the file alone.

use std::fmt;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostEntry {
    pub(crate) alias: String,
    pub(crate) hostname: String,
    pub(crate) user: String,
    pub(crate) port: u16,
    pub(crate) identity_file: String,
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Host {}", self.alias)?;
        writeln!(f, "  Hostname {}", self.hostname)?;
        writeln!(f, "  User {}", self.user)?;
        writeln!(f, "  Port {}", self.port)?;
        writeln!(f, "  IdentityFile {}", self.identity_file)
    }
}

/// If `line` starts a `Host` block, return its pattern list.
fn host_alias(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let (keyword, rest) = line.split_once(|c: char| c.is_whitespace() || c == '=')?;
    keyword
        .eq_ignore_ascii_case("host")
        .then(|| rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=').trim())
}

/// Copy `existing` without the block for `alias`, dropping trailing blank lines.
fn without_alias(existing: &str, alias: &str) -> String {
    let mut out = String::with_capacity(existing.len());
    let mut skipping = false;
    for line in existing.lines() {
        if let Some(a) = host_alias(line) {
            skipping = a == alias;
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    let keep = out.trim_end().len();
    out.truncate(keep);
    out
}

fn upsert_text(existing: &str, entry: &HostEntry) -> String {
    let mut out = without_alias(existing, &entry.alias);
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(&entry.to_string());
    out
}

fn read_optional(path: &Utf8Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Reading {path}")),
    }
}

fn replace_contents(path: &Utf8Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or(Utf8Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp file")?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all().context("syncing")?;
    tmp.persist(path)
        .with_context(|| format!("Renaming temp file to {path}"))?;
    Ok(())
}

/// Add or replace the block for `entry.alias` in `path`, creating the file if needed.
#[context("Writing host entry {} to {path}", entry.alias)]
pub(crate) fn upsert(path: &Utf8Path, entry: &HostEntry) -> Result<()> {
    let existing = read_optional(path)?.unwrap_or_default();
    replace_contents(path, &upsert_text(&existing, entry))?;
    tracing::info!("Wrote host entry {} ({}:{})", entry.alias, entry.hostname, entry.port);
    Ok(())
}

/// Remove the block for `alias`. Returns whether anything was removed.
#[context("Removing host entry {alias} from {path}")]
pub(crate) fn remove(path: &Utf8Path, alias: &str) -> Result<bool> {
    let Some(existing) = read_optional(path)? else {
        return Ok(false);
    };
    let mut updated = without_alias(&existing, alias);
    if !updated.is_empty() {
        updated.push('\n');
    }
    if updated == existing {
        return Ok(false);
    }
    replace_contents(path, &updated)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use indoc::indoc;

    fn entry(alias: &str, ip: &str) -> HostEntry {
        HostEntry {
            alias: alias.into(),
            hostname: ip.into(),
            user: "azureuser".into(),
            port: 2222,
            identity_file: format!("~/.ssh/{alias}-key"),
        }
    }

    fn tmpfile() -> (tempfile::TempDir, Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("demo1_hosts");
        (td, path)
    }

    #[test]
    fn test_stanza() {
        similar_asserts::assert_eq!(
            entry("demo1-vm-a", "10.0.0.5").to_string(),
            indoc! {"
                Host demo1-vm-a
                  Hostname 10.0.0.5
                  User azureuser
                  Port 2222
                  IdentityFile ~/.ssh/demo1-vm-a-key
            "}
        );
    }

    #[test]
    fn test_host_alias() {
        assert_eq!(host_alias("Host foo"), Some("foo"));
        assert_eq!(host_alias("  host=foo"), Some("foo"));
        assert_eq!(host_alias("Hostname 1.2.3.4"), None);
        assert_eq!(host_alias("  Port 22"), None);
    }

    #[test]
    fn test_repeated_upsert_single_stanza() {
        let (_td, path) = tmpfile();
        for i in 0..5 {
            upsert(&path, &entry("demo1-vm-a", &format!("10.0.0.{i}"))).unwrap();
        }
        let s = std::fs::read_to_string(&path).unwrap();
        assert_eq!(s.matches("Host demo1-vm-a").count(), 1);
        assert!(s.contains("Hostname 10.0.0.4\n"));
    }

    #[test]
    fn test_other_entries_preserved() {
        let (_td, path) = tmpfile();
        let preamble = indoc! {"
            # managed by hand
            Host bastion
              Hostname 192.0.2.1

        "};
        std::fs::write(&path, preamble).unwrap();
        upsert(&path, &entry("demo1-vm-a", "10.0.0.5")).unwrap();
        upsert(&path, &entry("demo1-vm-b", "10.0.0.6")).unwrap();
        upsert(&path, &entry("demo1-vm-a", "10.0.0.7")).unwrap();
        let s = std::fs::read_to_string(&path).unwrap();
        assert!(s.starts_with("# managed by hand\nHost bastion\n  Hostname 192.0.2.1\n\n"));
        assert_eq!(s.matches("Host ").count(), 3);
        assert!(s.contains("Hostname 10.0.0.6"));
        assert!(s.contains("Hostname 10.0.0.7"));
        assert!(!s.contains("10.0.0.5"));

        assert!(remove(&path, "demo1-vm-a").unwrap());
        assert!(!remove(&path, "demo1-vm-a").unwrap());
        let s = std::fs::read_to_string(&path).unwrap();
        assert!(!s.contains("demo1-vm-a"));
        assert!(s.contains("Host demo1-vm-b"));
        assert!(s.ends_with("IdentityFile ~/.ssh/demo1-vm-b-key\n"));
    }

    #[test]
    fn test_remove_missing_file() {
        let (_td, path) = tmpfile();
        assert!(!remove(&path, "x").unwrap());
        assert!(!path.exists());
    }
}
