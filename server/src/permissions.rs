//! Hierarchical permission engine.
//!
//! Permissions are dotted paths such as `hexmap.commands.roll`. Every path
//! must be registered before it can be granted or checked; registration
//! builds a tree of namespace nodes with leaves at the ends.
//!
//! A [`Grant`] either names one leaf exactly or names a namespace with a
//! trailing `*`, which covers every leaf below that namespace. The lone
//! grant `*` covers everything.
//!
//! Grants come from two places: the group a user belongs to and the user's
//! own override file. A session holds both, and a check passes if either
//! set covers the permission.

use log::{info, warn};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::StoreError;

static PERMISSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A(?:[a-z]+\.)*[a-z]+\z").expect("valid permission regex"));

static GRANT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\A(?:(?:[a-z]+\.)*(?:[a-z]+|\*)|\*)\z").expect("valid grant regex")
});

static USERNAME_FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A[A-Za-z0-9_-]{1,64}\z").expect("valid username regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("invalid permission \"{0}\"")]
    Invalid(String),
    #[error("permission \"{0}\" is already registered")]
    Duplicate(String),
    #[error("permission \"{0}\" is not registered")]
    Unregistered(String),
}

/// One entry in a grant set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grant {
    path: Vec<String>,
    wildcard: bool,
}

impl Grant {
    /// Parses `a.b.c`, `a.b.*` or `*`.
    pub fn parse(input: &str) -> Result<Self, PermissionError> {
        if !GRANT_PATTERN.is_match(input) {
            return Err(PermissionError::Invalid(input.to_string()));
        }

        let mut path: Vec<String> = input.split('.').map(str::to_string).collect();
        let wildcard = path.last().is_some_and(|last| last == "*");
        if wildcard {
            path.pop();
        }
        Ok(Self { path, wildcard })
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// True if this grant permits the leaf at `permission`.
    pub fn covers(&self, permission: &[&str]) -> bool {
        if self.wildcard {
            permission.len() > self.path.len()
                && self.path.iter().zip(permission).all(|(a, b)| a == b)
        } else {
            self.path.len() == permission.len()
                && self.path.iter().zip(permission).all(|(a, b)| a == b)
        }
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.path.is_empty(), self.wildcard) {
            (true, _) => f.write_str("*"),
            (false, true) => write!(f, "{}.*", self.path.join(".")),
            (false, false) => f.write_str(&self.path.join(".")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantSet {
    grants: HashSet<Grant>,
}

impl GrantSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, grant: Grant) -> bool {
        self.grants.insert(grant)
    }

    pub fn covers(&self, permission: &[&str]) -> bool {
        self.grants.iter().any(|grant| grant.covers(permission))
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// The grants a single session carries.
#[derive(Debug, Clone, Default)]
pub struct SessionPermissions {
    pub group: String,
    pub group_grants: GrantSet,
    pub user_grants: GrantSet,
}

impl SessionPermissions {
    fn covers(&self, permission: &[&str]) -> bool {
        self.user_grants.covers(permission) || self.group_grants.covers(permission)
    }
}

#[derive(Debug, Default)]
struct Namespace {
    children: HashMap<String, Namespace>,
    leaves: HashSet<String>,
}

/// Registry of every permission the server knows about.
#[derive(Debug, Default)]
pub struct PermissionTree {
    root: Namespace,
}

impl PermissionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a leaf permission, creating namespaces along the way.
    pub fn register(&mut self, permission: &str) -> Result<(), PermissionError> {
        if !PERMISSION_PATTERN.is_match(permission) {
            warn!("Refusing to register invalid permission {}", permission);
            return Err(PermissionError::Invalid(permission.to_string()));
        }

        let segments: Vec<&str> = permission.split('.').collect();
        let Some((leaf, namespaces)) = segments.split_last() else {
            return Err(PermissionError::Invalid(permission.to_string()));
        };

        let mut node = &mut self.root;
        for segment in namespaces {
            node = node.children.entry(segment.to_string()).or_default();
        }

        if !node.leaves.insert(leaf.to_string()) {
            warn!("Permission {} registered twice", permission);
            return Err(PermissionError::Duplicate(permission.to_string()));
        }
        Ok(())
    }

    fn namespace(&self, path: &[impl AsRef<str>]) -> Option<&Namespace> {
        let mut node = &self.root;
        for segment in path {
            node = node.children.get(segment.as_ref())?;
        }
        Some(node)
    }

    /// True if `permission` names a registered leaf.
    pub fn is_registered(&self, permission: &str) -> bool {
        if !PERMISSION_PATTERN.is_match(permission) {
            return false;
        }
        let segments: Vec<&str> = permission.split('.').collect();
        self.leaf_registered(&segments)
    }

    fn leaf_registered(&self, segments: &[&str]) -> bool {
        match segments.split_last() {
            Some((leaf, namespaces)) => self
                .namespace(namespaces)
                .is_some_and(|node| node.leaves.contains(*leaf)),
            None => false,
        }
    }

    /// Resolves `input` against the tree and adds it to `target`.
    ///
    /// Wildcards must name an existing namespace; exact grants must name a
    /// registered leaf.
    pub fn grant(&self, input: &str, target: &mut GrantSet) -> Result<(), PermissionError> {
        let grant = Grant::parse(input)?;

        let known = if grant.wildcard {
            self.namespace(&grant.path).is_some()
        } else {
            let segments: Vec<&str> = grant.path.iter().map(String::as_str).collect();
            self.leaf_registered(&segments)
        };
        if !known {
            return Err(PermissionError::Unregistered(input.to_string()));
        }

        target.insert(grant);
        Ok(())
    }

    /// Checks whether `permissions` allows `permission`.
    ///
    /// Unregistered or malformed paths are always denied, even for holders
    /// of the root wildcard.
    pub fn check(&self, permission: &str, permissions: &SessionPermissions) -> bool {
        if !PERMISSION_PATTERN.is_match(permission) {
            warn!("Permission check for invalid path {}", permission);
            return false;
        }

        let segments: Vec<&str> = permission.split('.').collect();
        if !self.leaf_registered(&segments) {
            warn!("Permission check for unregistered path {}", permission);
            return false;
        }

        permissions.covers(&segments)
    }
}

/// File-backed permission tables: the registered tree plus every group.
///
/// Layout under the permissions directory:
///
/// ```text
/// groups/<group>.txt    one grant per line
/// users/<username>.txt  optional "group <name>" first line, then grants
/// ```
///
/// Blank lines and lines starting with `#` are ignored.
#[derive(Debug)]
pub struct PermissionStore {
    tree: PermissionTree,
    groups: HashMap<String, GrantSet>,
    users_dir: PathBuf,
    default_group: String,
}

impl PermissionStore {
    /// Loads every group from `groups_dir`, creating the directories and an
    /// empty default group file when they are missing.
    pub fn load(
        tree: PermissionTree,
        groups_dir: &Path,
        users_dir: &Path,
        default_group: &str,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(groups_dir).map_err(|e| StoreError::io(groups_dir, e))?;
        fs::create_dir_all(users_dir).map_err(|e| StoreError::io(users_dir, e))?;

        let default_path = groups_dir.join(format!("{}.txt", default_group));
        if !default_path.exists() {
            info!("Creating empty default group at {}", default_path.display());
            fs::write(&default_path, "").map_err(|e| StoreError::io(&default_path, e))?;
        }

        let mut groups = HashMap::new();
        let entries = fs::read_dir(groups_dir).map_err(|e| StoreError::io(groups_dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(groups_dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let contents = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            let mut grants = GrantSet::new();
            for line in grant_lines(&contents) {
                apply_grant(&tree, line, &mut grants, &path);
            }
            info!("Loaded group {} with {} grants", name, grants.len());
            groups.insert(name.to_string(), grants);
        }

        Ok(Self {
            tree,
            groups,
            users_dir: users_dir.to_path_buf(),
            default_group: default_group.to_string(),
        })
    }

    pub fn tree(&self) -> &PermissionTree {
        &self.tree
    }

    pub fn group(&self, name: &str) -> Option<&GrantSet> {
        self.groups.get(name)
    }

    pub fn check(&self, permission: &str, permissions: &SessionPermissions) -> bool {
        self.tree.check(permission, permissions)
    }

    /// Builds the permissions for a user who just logged in.
    ///
    /// Falls back to the default group when the user has no override file,
    /// names an unknown group, or has a name unsafe to use as a file name.
    pub fn permissions_for(&self, username: &str) -> SessionPermissions {
        let mut group = self.default_group.clone();
        let mut user_grants = GrantSet::new();

        if USERNAME_FILE_PATTERN.is_match(username) {
            let path = self.users_dir.join(format!("{}.txt", username));
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    let mut lines = grant_lines(&contents).peekable();
                    if let Some(name) = lines.peek().and_then(|line| line.strip_prefix("group ")) {
                        group = name.trim().to_string();
                        lines.next();
                    }
                    for line in lines {
                        apply_grant(&self.tree, line, &mut user_grants, &path);
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to read {}: {}", path.display(), e),
            }
        } else {
            info!("Skipping permission file lookup for username {:?}", username);
        }

        if !self.groups.contains_key(&group) {
            warn!(
                "User {} names unknown group {}, using {}",
                username, group, self.default_group
            );
            group = self.default_group.clone();
        }

        SessionPermissions {
            group_grants: self.groups.get(&group).cloned().unwrap_or_default(),
            group,
            user_grants,
        }
    }
}

fn grant_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn apply_grant(tree: &PermissionTree, line: &str, target: &mut GrantSet, source: &Path) {
    if let Err(e) = tree.grant(line, target) {
        warn!("Skipping grant in {}: {}", source.display(), e);
    }
}
