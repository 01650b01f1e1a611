use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIRNAME: &str = ".autolinker";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const DB_FILENAME: &str = "autolinker.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

pub fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| {
        lookup_env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup);
    let state_dir = project_root.join(STATE_DIRNAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup("AUTOLINKER_DATA_DIR") {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = lookup("AUTOLINKER_CONFIG") {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_materialized_config(),
        options.force,
    )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# autolinker configuration (materialized by `autolinker init`)\n# Environment variables (AUTOLINK_*) override these values.\n\n[autolink]\n# api_url = \"https://other-wiki.example.org/w/api.php\"\nquery_limit = {query_limit}\nmax_titles = {max_titles}\nnamespace = 0\nexclude_links_to = []\n# only_within_class_name = \"mw-parser-output\"\n# category_name = \"Linked pages\"\n# user_agent = \"{user_agent}\"\ntimeout_ms = {timeout_ms}\n",
        query_limit = crate::config::DEFAULT_QUERY_LIMIT,
        max_titles = crate::config::DEFAULT_MAX_TITLES,
        user_agent = crate::config::DEFAULT_USER_AGENT,
        timeout_ms = crate::config::DEFAULT_TIMEOUT_MS,
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = lookup("AUTOLINKER_PROJECT_ROOT") {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    (root, ValueSource::Heuristic)
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    let mut candidates = cwd.ancestors().collect::<Vec<_>>();
    if let Some(exe_dir) = executable_dir {
        candidates.extend(exe_dir.ancestors());
    }
    for candidate in candidates {
        if !seen.insert(candidate) {
            continue;
        }
        if candidate.join(STATE_DIRNAME).is_dir() {
            return candidate.to_path_buf();
        }
    }
    cwd.to_path_buf()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
