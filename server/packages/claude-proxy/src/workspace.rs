//! Identity to sandbox directory resolution.
//!
//! Every filesystem location the gateway touches on behalf of a caller is
//! derived from a [`SessionWorkspace`]; no other code joins caller input onto
//! the base directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use claude_proxy_error::SandboxError;

use crate::config::GatewayConfig;

pub const DEFAULT_IDENTITY: &str = "default";
pub const UPLOADS_DIR: &str = ".files";
pub const SKILLS_DIR: &str = ".claude/skills";
pub const MANIFEST_FILE: &str = "CLAUDE.md";

/// Parent of every `<bot>/<session>` sandbox.
pub const BOTS_DIR: &str = "bots";
/// Parent of every sandbox keyed by a session alone.
pub const SESSIONS_DIR: &str = "sessions";

/// Caller-supplied identity keying a sandbox. Both parts are sanitized on
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    bot_id: Option<String>,
    session_id: String,
}

impl Identity {
    pub fn new(bot_id: Option<&str>, session_id: Option<&str>) -> Self {
        let bot_id = bot_id
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(sanitize_component);
        Self {
            bot_id,
            session_id: sanitize_component(session_id.unwrap_or_default()),
        }
    }

    /// `bot/session` or just `session`; used in log lines.
    pub fn key(&self) -> String {
        match &self.bot_id {
            Some(bot) => format!("{bot}/{}", self.session_id),
            None => self.session_id.clone(),
        }
    }

    /// Bot sandboxes and session-only sandboxes live in disjoint trees, and
    /// every sandbox sits at the same depth within its tree, so no sandbox
    /// root is ever an ancestor of another.
    fn relative_dir(&self) -> PathBuf {
        match &self.bot_id {
            Some(bot) => [BOTS_DIR, bot.as_str(), self.session_id.as_str()]
                .iter()
                .collect(),
            None => [SESSIONS_DIR, self.session_id.as_str()].iter().collect(),
        }
    }
}

/// Replaces characters outside `[A-Za-z0-9._-]` with `_`.
///
/// Inputs that are empty, contain no allowed character at all, or sanitize to
/// `.`/`..` collapse to [`DEFAULT_IDENTITY`].
pub fn sanitize_component(raw: &str) -> String {
    let raw = raw.trim();
    let mut any_valid = false;
    let sanitized: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                any_valid = true;
                ch
            } else {
                '_'
            }
        })
        .collect();
    if !any_valid || sanitized == "." || sanitized == ".." {
        return DEFAULT_IDENTITY.to_string();
    }
    sanitized
}

/// A resolved sandbox root with its session layout in place.
#[derive(Debug, Clone)]
pub struct SessionWorkspace {
    identity: Identity,
    root: PathBuf,
}

impl SessionWorkspace {
    /// Resolves `identity` under the configured workdir, creating the root,
    /// the uploads and skills directories and the manifest when missing.
    pub fn resolve(config: &GatewayConfig, identity: &Identity) -> Result<Self, SandboxError> {
        let root = config.workdir.join(identity.relative_dir());
        fs::create_dir_all(&root).map_err(|err| map_layout_error(&root, err))?;
        // Absolute even when the configured workdir is relative.
        let root = fs::canonicalize(&root).map_err(|err| map_layout_error(&root, err))?;

        let workspace = Self {
            identity: identity.clone(),
            root,
        };
        for path in [workspace.uploads_dir(), workspace.skills_dir()] {
            fs::create_dir_all(&path).map_err(|err| map_layout_error(&path, err))?;
        }
        ensure_manifest(&workspace.root)?;
        Ok(workspace)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Canonical, absolute sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join(SKILLS_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }
}

fn ensure_manifest(root: &Path) -> Result<(), SandboxError> {
    let path = root.join(MANIFEST_FILE);
    match fs::symlink_metadata(&path) {
        Ok(metadata) if metadata.is_file() => return Ok(()),
        Ok(_) => {
            return Err(SandboxError::WorkspaceConflict {
                message: format!("manifest path is not a regular file: {}", path.display()),
            })
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(map_layout_error(&path, err)),
    }

    let result = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .and_then(|mut file| {
            use std::io::Write;
            file.write_all(manifest_contents(root).as_bytes())
        });
    match result {
        Ok(()) => Ok(()),
        // Another request for the same identity won the race.
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(map_layout_error(&path, err)),
    }
}

fn manifest_contents(root: &Path) -> String {
    let root = root.display();
    format!(
        "# Session workspace\n\
         \n\
         Session root: `{root}`\n\
         \n\
         - This directory is the working directory for every run in this session.\n\
         - Files uploaded by the user are stored in `{root}/{UPLOADS_DIR}/`.\n\
         - Skills for this session live in `{root}/{SKILLS_DIR}/`.\n\
         - Only files under the session root can be sent back to the user; \
         refer to them by absolute path or by a path relative to the session root.\n"
    )
}

fn map_layout_error(path: &Path, err: std::io::Error) -> SandboxError {
    SandboxError::WorkspaceConflict {
        message: format!("{}: {err}", path.display()),
    }
}
