//! Storage roots that may hold downloaded model variants.
//!
//! Besides the directory this app manages, variants written by other tools
//! following the Hugging Face download conventions are picked up. Each
//! convention is a [`StorageConvention`] value; the resolver walks the list in
//! order and never special-cases a convention inline.

use crate::config::Config;
use crate::error::Result;
use crate::models::ledger::data_dir;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Directory name prefixes that mark a model variant
pub const MODEL_PREFIXES: &[&str] = &["openai_whisper", "distil-whisper"];

/// Environment variable naming a custom Hugging Face home
pub const HOME_ROOT_ENV: &str = "HF_HOME";

/// Environment variable naming a custom Hugging Face hub cache
pub const CACHE_ROOT_ENV: &str = "HF_HUB_CACHE";

/// How a repository is laid out beneath a base directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoLayout {
    /// `<base>/<repo>`
    Direct,
    /// `<base>/models/<repo>` as written by hub download tools
    Models,
    /// `<base>/models--<org>--<name>` as written by the hub cache
    HubCache,
}

/// Where the base directory of a convention comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseDir {
    AppManaged,
    Documents,
    HomeCache,
    SystemCache,
    Env(&'static str),
}

/// One storage convention: base directory rule, layout, name prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConvention {
    pub name: &'static str,
    pub base: BaseDir,
    pub layout: RepoLayout,
    pub prefixes: &'static [&'static str],
}

/// Built-in conventions in priority order
pub const CONVENTIONS: &[StorageConvention] = &[
    StorageConvention {
        name: "managed",
        base: BaseDir::AppManaged,
        layout: RepoLayout::Direct,
        prefixes: MODEL_PREFIXES,
    },
    StorageConvention {
        name: "documents",
        base: BaseDir::Documents,
        layout: RepoLayout::Models,
        prefixes: MODEL_PREFIXES,
    },
    StorageConvention {
        name: "home-cache",
        base: BaseDir::HomeCache,
        layout: RepoLayout::Models,
        prefixes: MODEL_PREFIXES,
    },
    StorageConvention {
        name: "system-cache",
        base: BaseDir::SystemCache,
        layout: RepoLayout::Models,
        prefixes: MODEL_PREFIXES,
    },
    StorageConvention {
        name: "hf-home",
        base: BaseDir::Env(HOME_ROOT_ENV),
        layout: RepoLayout::Models,
        prefixes: MODEL_PREFIXES,
    },
    StorageConvention {
        name: "hf-hub-cache",
        base: BaseDir::Env(CACHE_ROOT_ENV),
        layout: RepoLayout::HubCache,
        prefixes: MODEL_PREFIXES,
    },
];

/// A directory that may contain model variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRoot {
    pub path: PathBuf,
    pub convention: &'static str,
    pub prefixes: &'static [&'static str],
}

impl StorageRoot {
    /// Root outside any convention, scanned with the default prefixes
    #[must_use]
    pub fn custom(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            convention: "custom",
            prefixes: MODEL_PREFIXES,
        }
    }

    /// Whether a directory name marks a model variant for this root
    #[must_use]
    pub fn is_model_name(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix))
    }
}

/// Resolves the ordered, de-duplicated list of storage roots
#[derive(Debug, Clone)]
pub struct StorageRootResolver {
    repo: String,
    app_dir: PathBuf,
    documents_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    env: HashMap<&'static str, String>,
    extra_roots: Vec<PathBuf>,
    conventions: Vec<StorageConvention>,
}

impl StorageRootResolver {
    /// Resolver for `repo` with only the managed directory known
    #[must_use]
    pub fn new(repo: impl Into<String>, app_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            app_dir: app_dir.into(),
            documents_dir: None,
            home_dir: None,
            cache_dir: None,
            env: HashMap::new(),
            extra_roots: Vec::new(),
            conventions: CONVENTIONS.to_vec(),
        }
    }

    /// Resolver wired to the user's directories, environment and config
    pub fn from_config(config: &Config) -> Result<Self> {
        let app_dir = match &config.storage.models_dir {
            Some(dir) => dir.clone(),
            None => data_dir()?.join("models"),
        };

        let mut resolver = Self::new(config.download.repo.clone(), app_dir)
            .with_extra_roots(config.storage.extra_roots.clone());
        resolver.documents_dir = dirs::document_dir();
        resolver.home_dir = dirs::home_dir();
        resolver.cache_dir = dirs::cache_dir();

        for convention in CONVENTIONS {
            if let BaseDir::Env(var) = convention.base {
                if let Ok(value) = std::env::var(var) {
                    resolver.env.insert(var, value);
                }
            }
        }

        Ok(resolver)
    }

    #[must_use]
    pub fn with_documents_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.documents_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_home_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Set an environment override value (for testing)
    #[must_use]
    pub fn with_env(mut self, var: &'static str, value: impl Into<String>) -> Self {
        self.env.insert(var, value.into());
        self
    }

    #[must_use]
    pub fn with_extra_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.extra_roots = roots;
        self
    }

    /// Replace the convention list
    #[must_use]
    pub fn with_conventions(mut self, conventions: Vec<StorageConvention>) -> Self {
        self.conventions = conventions;
        self
    }

    /// Repository the roots belong to
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Directory this app downloads into
    #[must_use]
    pub fn managed_root(&self) -> PathBuf {
        RepoLayout::Direct.apply(&self.app_dir, &self.repo)
    }

    /// All candidate roots in priority order.
    ///
    /// Roots that do not exist are kept so callers can create them; duplicates
    /// (by absolute path) keep their first position.
    #[must_use]
    pub fn resolve_roots(&self) -> Vec<StorageRoot> {
        let mut seen = HashSet::new();
        let mut roots = Vec::new();

        let conventional = self.conventions.iter().filter_map(|convention| {
            self.base_dir(convention.base).map(|base| StorageRoot {
                path: convention.layout.apply(&base, &self.repo),
                convention: convention.name,
                prefixes: convention.prefixes,
            })
        });
        let extra = self.extra_roots.iter().cloned().map(StorageRoot::custom);

        for mut root in conventional.chain(extra) {
            root.path = absolute(&root.path);
            if seen.insert(root.path.clone()) {
                roots.push(root);
            } else {
                tracing::debug!(
                    path = %root.path.display(),
                    convention = root.convention,
                    "Skipping duplicate storage root"
                );
            }
        }

        roots
    }

    fn base_dir(&self, base: BaseDir) -> Option<PathBuf> {
        match base {
            BaseDir::AppManaged => Some(self.app_dir.clone()),
            BaseDir::Documents => self.documents_dir.as_ref().map(|d| d.join("huggingface")),
            BaseDir::HomeCache => self
                .home_dir
                .as_ref()
                .map(|d| d.join(".cache").join("huggingface")),
            BaseDir::SystemCache => self.cache_dir.as_ref().map(|d| d.join("huggingface")),
            BaseDir::Env(var) => self
                .env
                .get(var)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        }
    }
}

impl RepoLayout {
    fn apply(self, base: &Path, repo: &str) -> PathBuf {
        match self {
            Self::Direct => base.join(repo),
            Self::Models => base.join("models").join(repo),
            Self::HubCache => base.join(format!("models--{}", repo.replace('/', "--"))),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
