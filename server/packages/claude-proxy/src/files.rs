//! Sandboxed file upload and download.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use claude_proxy_error::SandboxError;
use url::Url;

use crate::workspace::SessionWorkspace;

const FALLBACK_STEM: &str = "file";
const MAX_FILENAME_CHARS: usize = 180;
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub requested_name: String,
    pub stored_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub path: PathBuf,
    pub in_scope: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub filename: String,
    pub path: PathBuf,
    pub content: Vec<u8>,
}

/// Reduces a client-supplied name to a safe basename.
///
/// `\` counts as a separator alongside `/`. The stem keeps word characters,
/// `.` and `-` (others become `_`) and loses leading/trailing dots and
/// spaces; the extension silently drops anything else. Names longer than 180
/// characters have their stem shortened so the extension survives.
pub fn sanitize_filename(raw: &str) -> String {
    let raw = raw.trim();
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let (stem_raw, ext_raw) = split_extension(base);

    let stem: String = stem_raw
        .chars()
        .map(|ch| if is_name_char(ch) { ch } else { '_' })
        .collect();
    let mut stem = stem.trim_matches(|ch| ch == '.' || ch == ' ').to_string();
    let ext: String = ext_raw.chars().filter(|ch| is_name_char(*ch)).collect();

    if stem.is_empty() {
        stem = FALLBACK_STEM.to_string();
    }
    let ext_chars = ext.chars().count();
    if stem.chars().count() + ext_chars > MAX_FILENAME_CHARS {
        let max_stem = MAX_FILENAME_CHARS.saturating_sub(ext_chars).max(1);
        stem = stem.chars().take(max_stem).collect();
    }
    format!("{stem}{ext}")
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-')
}

/// Splits `name` at its last dot. Leading dots never start an extension, so
/// `.env` has none.
fn split_extension(name: &str) -> (&str, &str) {
    let Some(dot) = name.rfind('.') else {
        return (name, "");
    };
    if name[..dot].chars().any(|ch| ch != '.') {
        (&name[..dot], &name[dot..])
    } else {
        (name, "")
    }
}

/// Rejects a blank name, an empty payload or one over `max_bytes`. Runs
/// before any filesystem access.
pub fn validate_upload(
    requested_name: &str,
    content: &[u8],
    max_bytes: u64,
) -> Result<(), SandboxError> {
    if requested_name.trim().is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "filename is required".to_string(),
        });
    }
    if content.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "empty file content".to_string(),
        });
    }
    let size = content.len() as u64;
    if size > max_bytes {
        return Err(SandboxError::PayloadTooLarge {
            size,
            max: max_bytes,
        });
    }
    Ok(())
}

/// Stores `content` under the workspace uploads directory.
///
/// The stored name is the sanitized requested name, suffixed `_1`, `_2`, ...
/// before the extension until a name is free. Files are created with
/// create-new semantics, so nothing is ever overwritten.
pub fn save_upload(
    workspace: &SessionWorkspace,
    requested_name: &str,
    content: &[u8],
    max_bytes: u64,
) -> Result<UploadedFile, SandboxError> {
    validate_upload(requested_name, content, max_bytes)?;
    let requested_name = requested_name.trim();
    let size = content.len() as u64;

    let dir = workspace.uploads_dir();
    fs::create_dir_all(&dir).map_err(|err| map_fs_error(&dir, err))?;

    let safe_name = sanitize_filename(requested_name);
    let (stem, ext) = split_extension(&safe_name);
    let mut index = 0usize;
    loop {
        let stored_name = if index == 0 {
            safe_name.clone()
        } else {
            format!("{stem}_{index}{ext}")
        };
        let path = dir.join(&stored_name);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                if let Err(err) = file.write_all(content).and_then(|_| file.flush()) {
                    drop(file);
                    let _ = fs::remove_file(&path);
                    return Err(map_fs_error(&path, err));
                }
                return Ok(UploadedFile {
                    requested_name: requested_name.to_string(),
                    stored_name,
                    path,
                    size,
                });
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => index += 1,
            Err(err) => return Err(map_fs_error(&path, err)),
        }
    }
}

/// Unwraps `file://` URIs into plain paths.
///
/// An empty or `localhost` host yields the URI path. Any other host is taken
/// to be the first segment of a path (`file://reports/a.txt` becomes
/// `/reports/a.txt`) with its case preserved; remote hosts are never
/// addressed. Everything that is not a `file://` URI is returned trimmed and
/// unchanged.
pub fn normalize_download_path(raw: &str) -> String {
    let raw = raw.trim();
    let Some(rest) = strip_file_scheme(raw) else {
        return raw.to_string();
    };
    // The authority is split off by hand: `Url` lowercases hosts.
    let (host, path) = match rest.find('/') {
        Some(slash) => rest.split_at(slash),
        None => (rest, ""),
    };
    let local = if host.is_empty() || host.eq_ignore_ascii_case("localhost") {
        path.to_string()
    } else {
        format!("/{host}{path}")
    };
    Url::parse(&format!("file://{local}"))
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| raw.to_string())
}

fn strip_file_scheme(raw: &str) -> Option<&str> {
    const SCHEME: &str = "file://";
    let prefix = raw.get(..SCHEME.len())?;
    prefix
        .eq_ignore_ascii_case(SCHEME)
        .then(|| &raw[SCHEME.len()..])
}

/// Resolves a raw client path against the workspace root.
///
/// Absolute input is tried as-is first; the same path re-rooted under the
/// sandbox is accepted only if it names an existing file. Relative input is
/// only ever resolved under the sandbox.
pub fn resolve_download(
    workspace: &SessionWorkspace,
    raw: &str,
) -> Result<DownloadTarget, SandboxError> {
    let normalized = normalize_download_path(raw);
    if normalized.is_empty() {
        return Err(SandboxError::InvalidRequest {
            message: "file_path is required".to_string(),
        });
    }
    let root = workspace.root();
    let input = PathBuf::from(&normalized);

    if !input.is_absolute() {
        let path = lenient_canonicalize(&root.join(&input));
        let in_scope = resolves_within(&path, root);
        return Ok(DownloadTarget { path, in_scope });
    }

    let direct = lenient_canonicalize(&input);
    if resolves_within(&direct, root) {
        return Ok(DownloadTarget {
            path: direct,
            in_scope: true,
        });
    }
    let relative: PathBuf = input
        .components()
        .filter(|component| !matches!(component, Component::RootDir | Component::Prefix(_)))
        .collect();
    let rerooted = lenient_canonicalize(&root.join(relative));
    if resolves_within(&rerooted, root) && rerooted.is_file() {
        return Ok(DownloadTarget {
            path: rerooted,
            in_scope: true,
        });
    }
    Ok(DownloadTarget {
        path: direct,
        in_scope: false,
    })
}

/// Reads an in-scope regular file no larger than `max_bytes`.
pub fn read_download(target: &DownloadTarget, max_bytes: u64) -> Result<DownloadedFile, SandboxError> {
    let path = &target.path;
    if !target.in_scope {
        return Err(SandboxError::PathOutOfScope {
            path: path.display().to_string(),
        });
    }
    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => {
            return Err(SandboxError::FileNotFound {
                path: path.display().to_string(),
            })
        }
        Err(err) => return Err(map_fs_error(path, err)),
    };
    if metadata.len() > max_bytes {
        return Err(SandboxError::PayloadTooLarge {
            size: metadata.len(),
            max: max_bytes,
        });
    }
    let content = fs::read(path).map_err(|err| map_fs_error(path, err))?;
    // The file may have grown between stat and read.
    if content.len() as u64 > max_bytes {
        return Err(SandboxError::PayloadTooLarge {
            size: content.len() as u64,
            max: max_bytes,
        });
    }
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(DownloadedFile {
        filename,
        path: path.clone(),
        content,
    })
}

/// Resolves `path` the way `realpath(3)` would, without requiring it to
/// exist.
///
/// Components are walked left to right and every symlink met on the way is
/// expanded before the next `..` is applied, including symlinks that follow a
/// missing component (`missing/../link/x`). Components that do not exist are
/// kept lexically.
pub fn lenient_canonicalize(path: &Path) -> PathBuf {
    let mut pending = owned_components(path);
    pending.reverse();
    let mut resolved = PathBuf::new();
    let mut hops = 0usize;
    while let Some(piece) = pending.pop() {
        match piece.components().next() {
            None | Some(Component::CurDir) => {}
            Some(Component::ParentDir) => {
                resolved.pop();
            }
            Some(Component::RootDir) | Some(Component::Prefix(_)) => resolved.push(&piece),
            Some(Component::Normal(name)) => {
                resolved.push(name);
                if hops >= MAX_SYMLINK_HOPS {
                    continue;
                }
                if let Ok(target) = fs::read_link(&resolved) {
                    hops += 1;
                    resolved.pop();
                    let mut expanded = owned_components(&target);
                    expanded.reverse();
                    pending.extend(expanded);
                }
            }
        }
    }
    resolved
}

fn owned_components(path: &Path) -> Vec<PathBuf> {
    path.components()
        .map(|component| PathBuf::from(component.as_os_str()))
        .collect()
}

fn is_within(path: &Path, root: &Path) -> bool {
    path == root || path.starts_with(root)
}

/// Scope check on the resolved path, repeated on the real path whenever the
/// target exists.
fn resolves_within(path: &Path, root: &Path) -> bool {
    if !is_within(path, root) {
        return false;
    }
    match fs::canonicalize(path) {
        Ok(real) => is_within(&real, root),
        Err(err) => err.kind() == ErrorKind::NotFound,
    }
}

fn map_fs_error(path: &Path, err: std::io::Error) -> SandboxError {
    if err.kind() == ErrorKind::NotFound {
        SandboxError::FileNotFound {
            path: path.display().to_string(),
        }
    } else {
        SandboxError::StreamError {
            message: format!("{}: {err}", path.display()),
        }
    }
}
