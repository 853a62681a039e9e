//! Project Registry — persists the set of managed projects to a TOML file.
//!
//! Grounded in the teacher's `Config::load`/`to_toml` round-trip shape
//! (`at-core/src/config.rs`), generalized to an array-of-tables file that
//! must preserve any global (non-project) keys already present, and to
//! accept both hyphen and underscore project keys on read.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use toml::Value;

use crate::error::{Error, Result};
use crate::types::{IssueBackend, PermissionsChecker, Project};

const PROJECTS_KEY: &str = "projects";
const DEFAULT_MAX_AGENTS: u32 = 1;

// ---------------------------------------------------------------------------
// ProjectRegistry
// ---------------------------------------------------------------------------

/// One RWMutex-equivalent guards the whole registry; reads take a read lock,
/// mutations take a write lock before `save()` (spec.md §5).
pub struct ProjectRegistry {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    projects: Vec<Project>,
    /// Top-level TOML keys other than `projects`, preserved verbatim on write.
    global: toml::value::Table,
}

impl ProjectRegistry {
    /// Open (or initialize) the registry at the default path
    /// `~/.config/fab/config.toml`.
    pub fn new() -> Result<Self> {
        Self::new_with_path(default_path())
    }

    pub fn new_with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inner = if path.exists() {
            load(&path)?
        } else {
            Inner {
                projects: Vec::new(),
                global: toml::value::Table::new(),
            }
        };
        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().projects.len()
    }

    pub fn list(&self) -> Vec<Project> {
        self.inner.read().unwrap().projects.clone()
    }

    pub fn get(&self, name: &str) -> Option<Project> {
        self.inner
            .read()
            .unwrap()
            .projects
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Validation order: remote URL -> derived/given name -> max_agents.
    /// Fails fast with the first error kind. On persistence failure the
    /// in-memory insert is rolled back.
    pub fn add(
        &self,
        remote_url: &str,
        name: Option<&str>,
        max_agents: u32,
        autostart: bool,
        agent_backend: &str,
    ) -> Result<Project> {
        if remote_url.trim().is_empty() {
            return Err(Error::Invalid("remote_url must not be empty".into()));
        }

        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => derive_name(remote_url)?,
        };
        if name.is_empty() {
            return Err(Error::Invalid("could not derive project name".into()));
        }

        let max_agents = if max_agents == 0 {
            DEFAULT_MAX_AGENTS
        } else {
            max_agents
        };

        let mut guard = self.inner.write().unwrap();
        if guard.projects.iter().any(|p| p.name == name) {
            return Err(Error::AlreadyExists(name));
        }

        let project = Project {
            name: name.clone(),
            remote_url: remote_url.to_string(),
            max_agents,
            autostart,
            issue_backend: IssueBackend::Tk,
            allowed_authors: Vec::new(),
            permissions_checker: PermissionsChecker::Manual,
            agent_backend: agent_backend.to_string(),
            base_dir: String::new(),
        };

        guard.projects.push(project.clone());
        if let Err(e) = save(&self.path, &guard) {
            guard.projects.retain(|p| p.name != name);
            return Err(e);
        }
        Ok(project)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        let before = guard.projects.len();
        guard.projects.retain(|p| p.name != name);
        if guard.projects.len() == before {
            return Err(Error::NotFound(name.to_string()));
        }
        save(&self.path, &guard)
    }

    pub fn update(
        &self,
        name: &str,
        max_agents: Option<u32>,
        autostart: Option<bool>,
    ) -> Result<Project> {
        let mut guard = self.inner.write().unwrap();
        let project = guard
            .projects
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if let Some(m) = max_agents {
            if m == 0 {
                return Err(Error::Invalid("max_agents must be >= 1".into()));
            }
            project.max_agents = m;
        }
        if let Some(a) = autostart {
            project.autostart = a;
        }
        let updated = project.clone();
        save(&self.path, &guard)?;
        Ok(updated)
    }

    pub fn get_config_value(&self, name: &str, key: &str) -> Result<String> {
        let guard = self.inner.read().unwrap();
        let project = guard
            .projects
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        config_value_of(project, key)
    }

    /// Closed set of config keys: `max-agents`, `autostart`, `issue-backend`,
    /// `allowed-authors`, `permissions-checker`.
    pub fn set_config_value(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        {
            let project = guard
                .projects
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            apply_config_value(project, key, value)?;
        }
        save(&self.path, &guard)
    }
}

fn config_value_of(project: &Project, key: &str) -> Result<String> {
    match key {
        "max-agents" | "max_agents" => Ok(project.max_agents.to_string()),
        "autostart" => Ok(project.autostart.to_string()),
        "issue-backend" | "issue_backend" => Ok(project.issue_backend.to_string()),
        "allowed-authors" | "allowed_authors" => Ok(project.allowed_authors.join(",")),
        "llm-auth" | "permissions-checker" | "permissions_checker" => {
            Ok(project.permissions_checker.to_string())
        }
        other => Err(Error::Invalid(format!("unknown config key: {other}"))),
    }
}

fn apply_config_value(project: &mut Project, key: &str, value: &str) -> Result<()> {
    match key {
        "max-agents" | "max_agents" => {
            let n: u32 = value
                .parse()
                .map_err(|_| Error::Invalid(format!("invalid max-agents: {value}")))?;
            if n == 0 {
                return Err(Error::Invalid("max-agents must be >= 1".into()));
            }
            project.max_agents = n;
        }
        "autostart" => {
            project.autostart = value
                .parse()
                .map_err(|_| Error::Invalid(format!("invalid autostart: {value}")))?;
        }
        "issue-backend" | "issue_backend" => {
            project.issue_backend = value
                .parse()
                .map_err(|_| Error::Invalid(format!("invalid issue-backend: {value}")))?;
        }
        "allowed-authors" | "allowed_authors" => {
            project.allowed_authors = if value.is_empty() {
                Vec::new()
            } else {
                value.split(',').map(|s| s.trim().to_string()).collect()
            };
        }
        "llm-auth" | "permissions-checker" | "permissions_checker" => {
            project.permissions_checker = value
                .parse()
                .map_err(|_| Error::Invalid(format!("invalid permissions-checker: {value}")))?;
        }
        other => return Err(Error::Invalid(format!("unknown config key: {other}"))),
    }
    Ok(())
}

/// Strips a trailing `.git` and takes the last path segment.
fn derive_name(remote_url: &str) -> Result<String> {
    let trimmed = remote_url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches(".git");
    if last.is_empty() {
        Err(Error::Invalid("could not derive project name".into()))
    } else {
        Ok(last.to_string())
    }
}

fn default_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fab")
        .join("config.toml")
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

fn load(path: &Path) -> Result<Inner> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = toml::from_str(&text)?;
    let table = value.as_table().cloned().unwrap_or_default();

    let mut projects = Vec::new();
    if let Some(Value::Array(entries)) = table.get(PROJECTS_KEY) {
        for entry in entries {
            if let Value::Table(t) = entry {
                projects.push(project_from_table(t)?);
            }
        }
    }

    let mut global = table;
    global.remove(PROJECTS_KEY);

    Ok(Inner { projects, global })
}

fn project_from_table(t: &toml::value::Table) -> Result<Project> {
    if t.contains_key("path") && !t.contains_key("remote-url") && !t.contains_key("remote_url") {
        return Err(Error::LegacyFormat);
    }

    let name = str_pref(t, "name", "name").unwrap_or_default();
    let remote_url = str_pref(t, "remote-url", "remote_url")
        .ok_or_else(|| Error::Invalid("project entry missing remote-url".into()))?;
    let max_agents = int_pref(t, "max-agents", "max_agents").unwrap_or(DEFAULT_MAX_AGENTS as i64) as u32;
    let autostart = bool_pref(t, "autostart", "autostart").unwrap_or(false);
    let issue_backend = str_pref(t, "issue-backend", "issue_backend")
        .and_then(|s| s.to_ascii_lowercase().parse().ok())
        .unwrap_or(IssueBackend::Tk);
    let allowed_authors = str_pref(t, "allowed-authors", "allowed_authors")
        .map(|s| {
            if s.is_empty() {
                Vec::new()
            } else {
                s.split(',').map(|a| a.trim().to_string()).collect()
            }
        })
        .unwrap_or_default();
    let permissions_checker = str_pref(t, "permissions-checker", "permissions_checker")
        .and_then(|s| s.parse().ok())
        .unwrap_or(PermissionsChecker::Manual);
    let agent_backend = str_pref(t, "agent-backend", "agent_backend").unwrap_or_default();
    let base_dir = str_pref(t, "base-dir", "base_dir").unwrap_or_default();

    Ok(Project {
        name,
        remote_url,
        max_agents,
        autostart,
        issue_backend,
        allowed_authors,
        permissions_checker,
        agent_backend,
        base_dir,
    })
}

/// Hyphen-keyed fields take precedence over underscore-keyed duplicates.
fn str_pref(t: &toml::value::Table, hyphen: &str, underscore: &str) -> Option<String> {
    t.get(hyphen)
        .or_else(|| t.get(underscore))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn int_pref(t: &toml::value::Table, hyphen: &str, underscore: &str) -> Option<i64> {
    t.get(hyphen).or_else(|| t.get(underscore)).and_then(|v| v.as_integer())
}

fn bool_pref(t: &toml::value::Table, hyphen: &str, underscore: &str) -> Option<bool> {
    t.get(hyphen).or_else(|| t.get(underscore)).and_then(|v| v.as_bool())
}

fn project_to_table(p: &Project) -> toml::value::Table {
    let mut t = toml::value::Table::new();
    t.insert("name".into(), Value::String(p.name.clone()));
    t.insert("remote-url".into(), Value::String(p.remote_url.clone()));
    t.insert("max-agents".into(), Value::Integer(p.max_agents as i64));
    t.insert("autostart".into(), Value::Boolean(p.autostart));
    t.insert(
        "issue-backend".into(),
        Value::String(p.issue_backend.to_string()),
    );
    t.insert(
        "allowed-authors".into(),
        Value::Array(
            p.allowed_authors
                .iter()
                .map(|a| Value::String(a.clone()))
                .collect(),
        ),
    );
    t.insert(
        "permissions-checker".into(),
        Value::String(p.permissions_checker.to_string()),
    );
    if !p.agent_backend.is_empty() {
        t.insert("agent-backend".into(), Value::String(p.agent_backend.clone()));
    }
    if !p.base_dir.is_empty() {
        t.insert("base-dir".into(), Value::String(p.base_dir.clone()));
    }
    t
}

/// Atomic write-tmp-then-rename, directory created first.
fn save(path: &Path, inner: &Inner) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut root = inner.global.clone();
    let projects: Vec<Value> = inner
        .projects
        .iter()
        .map(|p| Value::Table(project_to_table(p)))
        .collect();
    root.insert(PROJECTS_KEY.into(), Value::Array(projects));

    let text = toml::to_string_pretty(&Value::Table(root))?;
    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, text)?;
    match std::fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(Error::Io(e))
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

// ---------------------------------------------------------------------------
// Used by other projects' HashSet-based dedup in tests below.
// ---------------------------------------------------------------------------

#[allow(dead_code)]
fn unique_names(projects: &[Project]) -> HashSet<&str> {
    projects.iter().map(|p| p.name.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_derives_name_from_url_strips_git_suffix() {
        let dir = tempdir().unwrap();
        let reg = ProjectRegistry::new_with_path(dir.path().join("config.toml")).unwrap();
        let p = reg
            .add("git@github.com:u/myproj.git", None, 0, false, "claude")
            .unwrap();
        assert_eq!(p.name, "myproj");
        assert_eq!(p.max_agents, DEFAULT_MAX_AGENTS);
        assert!(reg.config_path().exists());
    }

    #[test]
    fn add_with_empty_url_is_invalid() {
        let dir = tempdir().unwrap();
        let reg = ProjectRegistry::new_with_path(dir.path().join("config.toml")).unwrap();
        let err = reg.add("", None, 1, false, "claude").unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn add_and_reopen_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        {
            let reg = ProjectRegistry::new_with_path(&path).unwrap();
            reg.add("git@github.com:u/myproj.git", None, 0, false, "claude")
                .unwrap();
        }
        let reg2 = ProjectRegistry::new_with_path(&path).unwrap();
        let list = reg2.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "myproj");
    }

    #[test]
    fn duplicate_name_is_already_exists() {
        let dir = tempdir().unwrap();
        let reg = ProjectRegistry::new_with_path(dir.path().join("config.toml")).unwrap();
        reg.add("git@github.com:u/myproj.git", None, 1, false, "claude")
            .unwrap();
        let err = reg
            .add("git@github.com:u/other.git", Some("myproj"), 1, false, "claude")
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn global_keys_survive_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "version = 3\n\n[[projects]]\nname = \"a\"\nremote-url = \"u\"\n")
            .unwrap();
        let reg = ProjectRegistry::new_with_path(&path).unwrap();
        reg.update("a", Some(2), None).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("version = 3"));
    }

    #[test]
    fn hyphen_key_wins_over_underscore_on_mixed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[[projects]]\nname = \"a\"\nremote-url = \"u\"\nmax-agents = 5\nmax_agents = 9\n",
        )
        .unwrap();
        let reg = ProjectRegistry::new_with_path(&path).unwrap();
        assert_eq!(reg.get("a").unwrap().max_agents, 5);
    }

    #[test]
    fn legacy_path_only_entry_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[projects]]\nname = \"a\"\npath = \"/old\"\n").unwrap();
        let err = ProjectRegistry::new_with_path(&path).unwrap_err();
        assert!(matches!(err, Error::LegacyFormat));
    }

    #[test]
    fn set_config_value_lowercases_issue_backend() {
        let dir = tempdir().unwrap();
        let reg = ProjectRegistry::new_with_path(dir.path().join("config.toml")).unwrap();
        reg.add("git@github.com:u/myproj.git", None, 1, false, "claude")
            .unwrap();
        reg.set_config_value("myproj", "issue-backend", "GITHUB")
            .unwrap();
        assert_eq!(reg.get_config_value("myproj", "issue-backend").unwrap(), "github");
    }

    #[test]
    fn allowed_authors_empty_string_clears() {
        let dir = tempdir().unwrap();
        let reg = ProjectRegistry::new_with_path(dir.path().join("config.toml")).unwrap();
        reg.add("git@github.com:u/myproj.git", None, 1, false, "claude")
            .unwrap();
        reg.set_config_value("myproj", "allowed-authors", "a, b").unwrap();
        assert_eq!(reg.get("myproj").unwrap().allowed_authors, vec!["a", "b"]);
        reg.set_config_value("myproj", "allowed-authors", "").unwrap();
        assert!(reg.get("myproj").unwrap().allowed_authors.is_empty());
    }

    #[test]
    fn max_agents_zero_or_negative_is_invalid_on_update() {
        let dir = tempdir().unwrap();
        let reg = ProjectRegistry::new_with_path(dir.path().join("config.toml")).unwrap();
        reg.add("git@github.com:u/myproj.git", None, 1, false, "claude")
            .unwrap();
        let err = reg.update("myproj", Some(0), None).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
