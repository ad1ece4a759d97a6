//! View manifests: named SQL artifacts with declared dependency sets.
//!
//! Two representations load into the same `Manifest`: a declarative document
//! (TOML or JSON) with explicit dependency sets, or a directory tree whose
//! level-numbered subdirectories hold view SQL files. Either way the result
//! must form a DAG rooted at the base table; cycles are invalid input and
//! are detected before anything executes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use fs_err as fs;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDef {
    pub name: String,
    pub sql: String,

    /// Names of other views (or the base table) this view reads from.
    pub depends_on: BTreeSet<String>,
}

#[derive(Debug)]
pub struct Manifest {
    pub base_table: String,
    pub views: BTreeMap<String, ViewDef>,
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    base_table: Option<String>,
    views: BTreeMap<String, ViewDoc>,
}

#[derive(Debug, Deserialize)]
struct ViewDoc {
    sql: String,
    #[serde(default)]
    depends_on: BTreeSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("dependency cycle among views: {}", cycle.join(", "))]
    InvalidManifest { cycle: Vec<String> },

    #[error("view '{view}' depends on unknown view '{dependency}'")]
    UnknownDependency { view: String, dependency: String },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no level-numbered subdirectories under {0}")]
    EmptyTree(PathBuf),
}

impl Manifest {
    pub fn from_toml(raw: &str, default_base_table: &str) -> Result<Self, ManifestError> {
        let doc: ManifestDoc = toml::from_str(raw)?;
        Self::from_doc(doc, default_base_table)
    }

    pub fn from_json(raw: &str, default_base_table: &str) -> Result<Self, ManifestError> {
        let doc: ManifestDoc = serde_json::from_str(raw)?;
        Self::from_doc(doc, default_base_table)
    }

    fn from_doc(doc: ManifestDoc, default_base_table: &str) -> Result<Self, ManifestError> {
        let base_table = doc
            .base_table
            .unwrap_or_else(|| default_base_table.to_string());
        let views = doc
            .views
            .into_iter()
            .map(|(name, view)| {
                let def = ViewDef {
                    name: name.clone(),
                    sql: view.sql,
                    depends_on: view.depends_on,
                };
                (name, def)
            })
            .collect();
        let manifest = Self { base_table, views };
        manifest.check_dependencies()?;
        Ok(manifest)
    }

    /// Discovers view files from a tree of `level_<n>…` subdirectories. A
    /// view in level *n* may read every view declared in lower-numbered
    /// levels plus the base table, so its dependency set is their union.
    pub fn from_directory(root: &Path, base_table: &str) -> Result<Self, ManifestError> {
        let mut levels: BTreeMap<u32, Vec<PathBuf>> = BTreeMap::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.metadata()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(level) = name.to_str().and_then(parse_level_dir) else {
                continue;
            };
            let mut sql_files: Vec<PathBuf> = fs::read_dir(entry.path())?
                .filter_map(|f| f.ok().map(|f| f.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
                .collect();
            sql_files.sort();
            levels.entry(level).or_default().extend(sql_files);
        }
        if levels.is_empty() {
            return Err(ManifestError::EmptyTree(root.to_path_buf()));
        }

        let mut views = BTreeMap::new();
        let mut lower_levels: BTreeSet<String> = BTreeSet::new();
        for files in levels.values() {
            let mut this_level = BTreeSet::new();
            for file in files {
                let name = file
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or_default()
                    .to_string();
                let sql = fs::read_to_string(file)?;
                let mut depends_on = lower_levels.clone();
                depends_on.insert(base_table.to_string());
                views.insert(
                    name.clone(),
                    ViewDef {
                        name: name.clone(),
                        sql,
                        depends_on,
                    },
                );
                this_level.insert(name);
            }
            lower_levels.extend(this_level);
        }

        let manifest = Self {
            base_table: base_table.to_string(),
            views,
        };
        manifest.check_dependencies()?;
        Ok(manifest)
    }

    fn check_dependencies(&self) -> Result<(), ManifestError> {
        for view in self.views.values() {
            for dependency in &view.depends_on {
                if dependency != &self.base_table && !self.views.contains_key(dependency) {
                    return Err(ManifestError::UnknownDependency {
                        view: view.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Topological levels: a view lands in the first level where all of its
    /// dependencies are already placed (the base table is level 0). Views
    /// within one level are independent of each other. A cycle fails the
    /// whole manifest, naming its members.
    pub fn levels(&self) -> Result<Vec<Vec<&ViewDef>>, ManifestError> {
        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: BTreeMap<&str, &ViewDef> = self
            .views
            .iter()
            .map(|(name, view)| (name.as_str(), view))
            .collect();
        let mut levels = vec![];

        while !remaining.is_empty() {
            let ready: Vec<&ViewDef> = remaining
                .values()
                .filter(|view| {
                    view.depends_on.iter().all(|dependency| {
                        dependency == &self.base_table || placed.contains(dependency.as_str())
                    })
                })
                .copied()
                .collect();
            if ready.is_empty() {
                let cycle: Vec<String> =
                    remaining.keys().map(|name| name.to_string()).collect();
                return Err(ManifestError::InvalidManifest { cycle });
            }
            for view in &ready {
                remaining.remove(view.name.as_str());
                placed.insert(view.name.as_str());
            }
            levels.push(ready);
        }
        Ok(levels)
    }
}

fn parse_level_dir(name: &str) -> Option<u32> {
    let rest = name.strip_prefix("level_")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
