/// Project filesystem access: enumeration with ignore rules, text/binary
/// sniffing, safe reads/writes and JSONL persistence.
///
/// All paths crossing this boundary are project-relative POSIX strings.
/// `resolve` is the single choke point that rejects absolute paths and
/// `..` escapes before anything touches the disk.
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use ignore::WalkBuilder;
use serde::Serialize;

use crate::error::KaiError;

/// Sniff window for the text/binary decision.
const SNIFF_BYTES: usize = 8 * 1024;
/// Minimum fraction of printable/whitespace bytes for a file to count as text.
const PRINTABLE_RATIO: f64 = 0.95;

pub struct ProjectFs {
    root: PathBuf,
    chats_dir: String,
    cache_file: String,
}

impl ProjectFs {
    pub fn new(root: impl Into<PathBuf>, chats_dir: &str, cache_file: &str) -> Self {
        Self {
            root: root.into(),
            chats_dir: to_posix(chats_dir),
            cache_file: to_posix(cache_file),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path to an absolute one, rejecting
    /// absolute inputs and anything that escapes the root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, KaiError> {
        let norm = to_posix(rel);
        let candidate = Path::new(&norm);
        if norm.is_empty() || candidate.is_absolute() {
            return Err(KaiError::PathEscape(PathBuf::from(rel)));
        }
        for component in candidate.components() {
            match component {
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(KaiError::PathEscape(PathBuf::from(rel)));
                }
                _ => {}
            }
        }
        Ok(self.root.join(candidate))
    }

    // ── Enumeration ───────────────────────────────────────────────────────────

    /// All non-ignored text files, as sorted project-relative POSIX paths.
    pub fn enumerate(&self) -> Vec<String> {
        self.walk()
            .into_iter()
            .filter(|abs| self.is_text(abs))
            .filter_map(|abs| self.relativize(&abs))
            .collect()
    }

    /// Like `enumerate`, but binary files are included (the analyzer
    /// classifies them itself).
    pub fn enumerate_all(&self) -> Vec<String> {
        self.walk()
            .into_iter()
            .filter_map(|abs| self.relativize(&abs))
            .collect()
    }

    /// Walk the project tree: gitignore rules honored, symlinked directories
    /// not descended, `.git` and `.kai` always excluded, deterministic order.
    fn walk(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .follow_links(false)
            .require_git(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(|entry| {
                let name = entry.file_name();
                name != std::ffi::OsStr::new(".git") && name != std::ffi::OsStr::new(".kai")
            })
            .build();
        for entry in walker.flatten() {
            if entry.file_type().is_some_and(|t| t.is_file()) {
                out.push(entry.into_path());
            }
        }
        out
    }

    fn relativize(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.root).ok()?;
        let posix = to_posix(&rel.to_string_lossy());
        // Built-in excludes beyond the walker: the conversation log dir and
        // the analysis cache may live outside `.kai` when reconfigured.
        if posix.starts_with(&format!("{}/", self.chats_dir))
            || posix == self.chats_dir
            || posix == self.cache_file
        {
            return None;
        }
        Some(posix)
    }

    /// Text sniff on the first 8 KiB: no NUL byte and at least 95%
    /// printable/whitespace. Read errors count as text.
    pub fn is_text(&self, path: &Path) -> bool {
        let Ok(mut file) = fs::File::open(path) else {
            return true;
        };
        let mut buf = [0u8; SNIFF_BYTES];
        let n = match file.read(&mut buf) {
            Ok(n) => n,
            Err(_) => return true,
        };
        if n == 0 {
            return true;
        }
        let window = &buf[..n];
        if window.contains(&0) {
            return false;
        }
        let printable = window
            .iter()
            .filter(|&&b| b >= 0x20 || b == b'\t' || b == b'\n' || b == b'\r')
            .count();
        printable as f64 / n as f64 >= PRINTABLE_RATIO
    }

    // ── Read / write ──────────────────────────────────────────────────────────

    /// Read a project file. Missing file is `None`; any other error surfaces.
    pub fn read(&self, rel: &str) -> Result<Option<String>, KaiError> {
        let path = self.resolve(rel)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write UTF-8 content, creating parent directories as needed.
    pub fn write(&self, rel: &str, content: &str) -> Result<(), KaiError> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(())
    }

    /// Write via a sibling temp file + rename, so readers never observe a
    /// half-written file.
    pub fn write_atomic(&self, rel: &str, content: &str) -> Result<(), KaiError> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_name = match path.file_name() {
            Some(name) => format!("{}.kai-tmp", name.to_string_lossy()),
            None => return Err(KaiError::PathEscape(path)),
        };
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Remove a file. Returns `Ok(false)` when it was already absent.
    pub fn remove(&self, rel: &str) -> Result<bool, KaiError> {
        let path = self.resolve(rel)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ── JSONL ─────────────────────────────────────────────────────────────────

    /// Append one JSON object as a single LF-terminated line, creating the
    /// file and its parents on first use. Flushed before returning.
    pub fn append_jsonl<T: Serialize>(&self, rel: &str, value: &T) -> Result<(), KaiError> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(value)
            .map_err(|e| KaiError::Parse(format!("jsonl serialize: {e}")))?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        file.flush()?;
        Ok(())
    }

    /// All non-empty lines of a JSONL file. Missing file is an empty list.
    pub fn read_jsonl(&self, rel: &str) -> Result<Vec<String>, KaiError> {
        match self.read(rel)? {
            None => Ok(Vec::new()),
            Some(content) => Ok(content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(str::to_string)
                .collect()),
        }
    }

    // ── Gitignore bootstrap ───────────────────────────────────────────────────

    /// Make sure `.kai/` is ignored: create a default `.gitignore` when the
    /// project has none, or append the rule once when it's missing.
    pub fn ensure_gitignore(&self) -> Result<(), KaiError> {
        const RULE: &str = ".kai/";
        let path = self.root.join(".gitignore");
        if !path.exists() {
            fs::write(&path, format!("{RULE}\n"))?;
            return Ok(());
        }
        let existing = fs::read_to_string(&path)?;
        let already = existing
            .lines()
            .any(|l| matches!(l.trim(), ".kai" | ".kai/" | "/.kai" | "/.kai/"));
        if already {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new().append(true).open(&path)?;
        if !existing.ends_with('\n') {
            writeln!(file)?;
        }
        writeln!(file, "{RULE}")?;
        Ok(())
    }
}

/// Normalize separators to `/` and strip a leading `./`.
pub fn to_posix(path: &str) -> String {
    let p = path.replace('\\', "/");
    p.strip_prefix("./").unwrap_or(&p).trim_end_matches('/').to_string()
}
