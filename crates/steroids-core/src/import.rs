//! TOML seed ingestion: populate sections, dependencies, and tasks from
//! an operator-authored file.
//!
//! ```toml
//! [[sections]]
//! name = "schema"
//! priority = 10
//! tasks = ["Create tables", { title = "Write seed data" }]
//!
//! [[sections]]
//! name = "api"
//! priority = 5
//! depends_on = ["schema"]
//! tasks = ["Expose CRUD endpoints"]
//!
//! [[tasks]]
//! title = "Sectionless chore"
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use steroids_db::queries::{sections, tasks};

/// A task entry: either a bare title or a table with a title.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SeedTask {
    Title(String),
    Detailed { title: String },
}

impl SeedTask {
    fn title(&self) -> &str {
        match self {
            Self::Title(title) | Self::Detailed { title } => title,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedSection {
    pub name: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<SeedTask>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub sections: Vec<SeedSection>,
    #[serde(default)]
    pub tasks: Vec<SeedTask>,
}

/// Counts reported after an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub sections: usize,
    pub dependencies: usize,
    pub tasks: usize,
}

/// Parse a seed file from disk.
pub fn load_seed(path: &Path) -> Result<SeedFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    let seed: SeedFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse seed file {}", path.display()))?;
    Ok(seed)
}

/// Validate a seed: unique section names, known dependency targets, no
/// self-dependencies.
pub fn validate_seed(seed: &SeedFile) -> Result<()> {
    let mut names = HashMap::new();
    for section in &seed.sections {
        if names.insert(section.name.as_str(), ()).is_some() {
            bail!("duplicate section name: {}", section.name);
        }
    }
    for section in &seed.sections {
        for dep in &section.depends_on {
            if dep == &section.name {
                bail!("section {} depends on itself", section.name);
            }
            if !names.contains_key(dep.as_str()) {
                bail!("section {} depends on unknown section {dep}", section.name);
            }
        }
    }
    Ok(())
}

/// Import a seed into the project database, recording `source_file` on
/// every created row.
pub async fn import_seed(
    pool: &SqlitePool,
    seed: &SeedFile,
    source_file: Option<&str>,
) -> Result<ImportSummary> {
    validate_seed(seed)?;

    let now = Utc::now();
    let mut summary = ImportSummary::default();
    let mut ids_by_name: HashMap<&str, Uuid> = HashMap::new();

    for section in &seed.sections {
        // Re-importing an existing section adds its new tasks instead of
        // failing on the unique name.
        let row = match sections::get_section_by_name(pool, &section.name).await? {
            Some(existing) => existing,
            None => {
                summary.sections += 1;
                sections::insert_section(
                    pool,
                    Uuid::new_v4(),
                    &section.name,
                    section.priority,
                    source_file,
                    now,
                )
                .await?
            }
        };
        ids_by_name.insert(section.name.as_str(), row.id);
    }

    for section in &seed.sections {
        let section_id = ids_by_name[section.name.as_str()];
        for dep in &section.depends_on {
            sections::insert_dependency(pool, section_id, ids_by_name[dep.as_str()]).await?;
            summary.dependencies += 1;
        }
        for task in &section.tasks {
            tasks::insert_task(
                pool,
                Uuid::new_v4(),
                task.title(),
                Some(section_id),
                source_file,
                None,
                now,
            )
            .await?;
            summary.tasks += 1;
        }
    }

    for task in &seed.tasks {
        tasks::insert_task(pool, Uuid::new_v4(), task.title(), None, source_file, None, now)
            .await?;
        summary.tasks += 1;
    }

    Ok(summary)
}
