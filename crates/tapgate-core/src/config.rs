use crate::batch::DEFAULT_BATCH_CONCURRENCY;
use crate::errors::ConfigError;
use crate::model::{
    CategoryPlan, Requirement, RequirementKind, SchemaSnapshot, SqlDialect, TestCase, TestPlan,
};
use crate::triage::DEFAULT_SQL_RETRY_CEILING;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_FILE: &str = "tapgate.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version", alias = "configVersion")]
    pub version: u32,
    pub goal: String,
    #[serde(default)]
    pub settings: Settings,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    pub requirements: Vec<CategoryConfig>,
}

fn default_version() -> u32 {
    SUPPORTED_CONFIG_VERSION
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub parallel: Option<usize>,
    /// Per oracle call.
    pub timeout_seconds: Option<u64>,
    pub execution_timeout_seconds: Option<u64>,
    pub max_generation_attempts: Option<u32>,
    pub sql_retry_ceiling: Option<u32>,
}

impl Settings {
    pub fn parallel(&self) -> usize {
        self.parallel.unwrap_or(DEFAULT_BATCH_CONCURRENCY).max(1)
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(120).max(1)
    }

    pub fn execution_timeout_seconds(&self) -> u64 {
        self.execution_timeout_seconds.unwrap_or(30).max(1)
    }

    pub fn max_generation_attempts(&self) -> u32 {
        self.max_generation_attempts.unwrap_or(3).max(1)
    }

    pub fn sql_retry_ceiling(&self) -> u32 {
        self.sql_retry_ceiling.unwrap_or(DEFAULT_SQL_RETRY_CEILING)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddl: Option<String>,
    /// Resolved relative to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ddl_file: Option<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub dialect: SqlDialect,
    /// Pre-rendered schema text for the oracle; defaults to the DDL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleProvider {
    #[default]
    Fixture,
    Openai,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleConfig {
    #[serde(default)]
    pub provider: OracleProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub category: String,
    pub test_cases: Vec<TestCaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseConfig {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    /// Pre-accepted SQL; such cases skip generation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sql: String,
}

impl PipelineConfig {
    pub fn to_plan(&self) -> TestPlan {
        TestPlan {
            categories: self
                .requirements
                .iter()
                .map(|cat| CategoryPlan {
                    name: cat.category.clone(),
                    test_cases: cat
                        .test_cases
                        .iter()
                        .map(|tc| {
                            let mut case = TestCase::new(
                                tc.id.clone(),
                                Requirement {
                                    category: cat.category.clone(),
                                    title: tc.title.clone(),
                                    kind: tc.kind,
                                },
                            );
                            case.sql = tc.sql.trim().to_string();
                            case
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn schema_snapshot(&self) -> SchemaSnapshot {
        let ddl = self.schema.ddl.clone().unwrap_or_default();
        let mut snapshot = SchemaSnapshot::new(ddl, self.schema.dialect)
            .with_extensions(self.schema.extensions.clone());
        if let Some(rendered) = &self.schema.rendered {
            snapshot = snapshot.with_rendered(rendered.clone());
        }
        snapshot
    }
}

pub fn load_config(path: &Path, strict: bool) -> Result<PipelineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;

    let mut ignored_keys = HashSet::new();
    let deserializer = serde_yaml::Deserializer::from_str(&raw);
    let mut cfg: PipelineConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.insert(p.to_string());
    })
    .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

    // `x-` and `_` prefixed keys are reserved for YAML anchors.
    let mut unknown: Vec<String> = ignored_keys
        .into_iter()
        .filter(|k| !k.starts_with('_') && !k.starts_with("x-"))
        .collect();
    unknown.sort();
    if !unknown.is_empty() {
        if strict {
            return Err(ConfigError(format!(
                "Unknown fields detected in strict mode: {:?} (file: {})",
                unknown,
                path.display()
            )));
        }
        tracing::warn!(event = "config.unknown_fields", fields = ?unknown, "ignored unknown config fields");
    }

    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }

    validate(&cfg)?;
    resolve_paths(&mut cfg, path)?;
    Ok(cfg)
}

fn validate(cfg: &PipelineConfig) -> Result<(), ConfigError> {
    if cfg.requirements.iter().all(|c| c.test_cases.is_empty()) {
        return Err(ConfigError("config has no requirements".into()));
    }

    let mut seen = HashSet::new();
    for tc in cfg.requirements.iter().flat_map(|c| &c.test_cases) {
        if tc.id.trim().is_empty() {
            return Err(ConfigError("test case with empty id".into()));
        }
        if !seen.insert(tc.id.as_str()) {
            return Err(ConfigError(format!("duplicate test case id '{}'", tc.id)));
        }
    }

    match (&cfg.schema.ddl, &cfg.schema.ddl_file) {
        (Some(_), Some(_)) => Err(ConfigError(
            "schema: set either 'ddl' or 'ddl_file', not both".into(),
        )),
        (None, None) => Err(ConfigError("schema: 'ddl' or 'ddl_file' is required".into())),
        _ => Ok(()),
    }
}

fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_paths(cfg: &mut PipelineConfig, config_path: &Path) -> Result<(), ConfigError> {
    let dir = config_dir(config_path);

    if let Some(file) = cfg.schema.ddl_file.clone() {
        let resolved = resolve(&dir, &file);
        let ddl = std::fs::read_to_string(&resolved).map_err(|e| {
            ConfigError(format!("failed to read ddl_file {}: {}", resolved.display(), e))
        })?;
        cfg.schema.ddl = Some(ddl);
        cfg.schema.ddl_file = Some(resolved.to_string_lossy().into_owned());
    }

    if let Some(file) = cfg.oracle.fixture_file.as_mut() {
        *file = resolve(&dir, file).to_string_lossy().into_owned();
    }
    Ok(())
}

fn resolve(dir: &Path, file: &str) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        dir.join(p)
    }
}

pub fn apply_env_overrides(cfg: &mut PipelineConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// `TAPGATE_PARALLEL`, `TAPGATE_TIMEOUT_SECONDS`, `TAPGATE_SQL_RETRY_CEILING`
/// and `OPENAI_API_KEY`. Unparseable numbers are ignored with a warning.
pub fn apply_overrides(cfg: &mut PipelineConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = parse_var(&lookup, "TAPGATE_PARALLEL") {
        cfg.settings.parallel = Some(n);
    }
    if let Some(n) = parse_var(&lookup, "TAPGATE_TIMEOUT_SECONDS") {
        cfg.settings.timeout_seconds = Some(n);
    }
    if let Some(n) = parse_var(&lookup, "TAPGATE_SQL_RETRY_CEILING") {
        cfg.settings.sql_retry_ceiling = Some(n);
    }
    if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
        cfg.oracle.api_key = Some(key);
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(event = "config.bad_env", key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

const SAMPLE_CONFIG: &str = r#"version: 1
goal: "Online shop: customers register and place orders."
settings:
  parallel: 3
  timeout_seconds: 120
  execution_timeout_seconds: 30
  max_generation_attempts: 3
  sql_retry_ceiling: 3
schema:
  dialect: sqlite
  ddl_file: schema.sql
oracle:
  provider: fixture
  fixture_file: fixtures.yaml
requirements:
  - category: customers
    test_cases:
      - id: customers-insert
        title: "A customer can be registered with an email address"
        type: INSERT
  - category: orders
    test_cases:
      - id: orders-insert
        title: "An order belongs to an existing customer"
        type: INSERT
      - id: orders-select
        title: "Order totals can be summed per customer"
        type: SELECT
"#;

const SAMPLE_SCHEMA: &str = "\
CREATE TABLE customers (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE
);

CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    customer_id INTEGER NOT NULL REFERENCES customers(id),
    total_cents INTEGER NOT NULL CHECK (total_cents >= 0)
);
";

const SAMPLE_FIXTURES: &str = r#"candidates:
  customers-insert:
    - sql: |
        INSERT INTO customers (id, email) VALUES (1, 'ada@example.com');
        SELECT CASE WHEN count(*) = 1 THEN 'ok 1 - customer registered' ELSE 'not ok 1 - customer registered' END FROM customers;
      rationale: insert one customer and count it
  orders-insert:
    - |
      INSERT INTO customers (id, email) VALUES (1, 'ada@example.com');
      INSERT INTO orders (id, customer_id, total_cents) VALUES (10, 1, 2500);
      SELECT CASE WHEN count(*) = 1 THEN 'ok 1 - order stored for customer' ELSE 'not ok 1 - order stored for customer' END FROM orders WHERE customer_id = 1;
  orders-select:
    - |
      INSERT INTO customers (id, email) VALUES (1, 'ada@example.com');
      INSERT INTO orders (id, customer_id, total_cents) VALUES (10, 1, 2500), (11, 1, 500);
      SELECT CASE WHEN sum(total_cents) = 3000 THEN 'ok 1 - totals summed' ELSE 'not ok 1 - totals summed' END FROM orders WHERE customer_id = 1;
"#;

/// Writes `tapgate.yaml`, `schema.sql` and `fixtures.yaml` into `dir`.
/// Existing files are left alone. Returns the config path.
pub fn write_sample_config(dir: &Path) -> Result<PathBuf, ConfigError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| ConfigError(format!("failed to create {}: {}", dir.display(), e)))?;

    for (name, content) in [
        (DEFAULT_CONFIG_FILE, SAMPLE_CONFIG),
        ("schema.sql", SAMPLE_SCHEMA),
        ("fixtures.yaml", SAMPLE_FIXTURES),
    ] {
        let path = dir.join(name);
        if path.exists() {
            tracing::info!(event = "init.skip_existing", path = %path.display());
            continue;
        }
        std::fs::write(&path, content)
            .map_err(|e| ConfigError(format!("failed to write {}: {}", path.display(), e)))?;
    }

    Ok(dir.join(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    const MINIMAL: &str = r#"
version: 1
goal: g
schema:
  ddl: "CREATE TABLE t (id INTEGER);"
requirements:
  - category: t
    test_cases:
      - id: t-1
        title: rows exist
        type: SELECT
"#;

    #[test]
    fn minimal_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = load_config(&write(tmp.path(), "c.yaml", MINIMAL), true).unwrap();
        assert_eq!(cfg.settings.parallel(), 3);
        assert_eq!(cfg.settings.sql_retry_ceiling(), 3);
        assert_eq!(cfg.oracle.provider, OracleProvider::Fixture);
        assert_eq!(cfg.schema.dialect, SqlDialect::Sqlite);

        let plan = cfg.to_plan();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.categories[0].test_cases[0].requirement.kind, RequirementKind::Select);
        assert!(plan.categories[0].test_cases[0].is_pending());
    }

    #[test]
    fn config_version_alias_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = MINIMAL.replace("version: 1", "configVersion: 1");
        assert!(load_config(&write(tmp.path(), "c.yaml", &raw), true).is_ok());

        let raw = MINIMAL.replace("version: 1", "version: 2");
        let err = load_config(&write(tmp.path(), "c.yaml", &raw), false).unwrap_err();
        assert!(err.0.contains("unsupported config version 2"));
    }

    #[test]
    fn unknown_keys_fail_only_in_strict_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let raw = format!("{}suite: legacy\nx-anchor: 1\n", MINIMAL);
        let path = write(tmp.path(), "c.yaml", &raw);

        let err = load_config(&path, true).unwrap_err();
        assert!(err.0.contains("suite"));
        assert!(!err.0.contains("x-anchor"));
        assert!(load_config(&path, false).is_ok());
    }

    #[test]
    fn ddl_file_is_resolved_relative_to_config() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("db")).unwrap();
        write(&tmp.path().join("db"), "schema.sql", "CREATE TABLE x (id INTEGER);");
        let raw = MINIMAL.replace(
            "ddl: \"CREATE TABLE t (id INTEGER);\"",
            "ddl_file: db/schema.sql\n  extensions: [pgtap]\n  dialect: postgres",
        );
        let cfg = load_config(&write(tmp.path(), "c.yaml", &raw), true).unwrap();

        let snap = cfg.schema_snapshot();
        assert_eq!(snap.ddl, "CREATE TABLE x (id INTEGER);");
        assert_eq!(snap.rendered, snap.ddl);
        assert_eq!(snap.extensions, vec!["pgtap".to_string()]);
        assert_eq!(snap.dialect, SqlDialect::Postgres);
    }

    #[test]
    fn duplicate_ids_and_missing_schema_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dup = MINIMAL.replace(
            "        type: SELECT\n",
            "        type: SELECT\n      - id: t-1\n        title: again\n        type: DELETE\n",
        );
        let err = load_config(&write(tmp.path(), "c.yaml", &dup), true).unwrap_err();
        assert!(err.0.contains("duplicate test case id 't-1'"));

        let no_schema = MINIMAL.replace("  ddl: \"CREATE TABLE t (id INTEGER);\"\n", "  dialect: sqlite\n");
        let err = load_config(&write(tmp.path(), "c.yaml", &no_schema), true).unwrap_err();
        assert!(err.0.contains("'ddl' or 'ddl_file' is required"));
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = load_config(&write(tmp.path(), "c.yaml", MINIMAL), true).unwrap();

        apply_overrides(&mut cfg, |k| match k {
            "TAPGATE_PARALLEL" => Some("8".into()),
            "TAPGATE_TIMEOUT_SECONDS" => Some("soon".into()),
            "TAPGATE_SQL_RETRY_CEILING" => Some(" 5 ".into()),
            "OPENAI_API_KEY" => Some("sk-test".into()),
            _ => None,
        });
        assert_eq!(cfg.settings.parallel(), 8);
        assert_eq!(cfg.settings.timeout_seconds(), 120);
        assert_eq!(cfg.settings.sql_retry_ceiling(), 5);
        assert_eq!(cfg.oracle.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn sample_config_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_sample_config(tmp.path()).unwrap();
        let cfg = load_config(&path, true).unwrap();
        assert_eq!(cfg.to_plan().len(), 3);
        assert!(cfg.schema.ddl.as_deref().unwrap_or_default().contains("CREATE TABLE orders"));
        assert!(cfg.oracle.fixture_file.as_deref().unwrap_or_default().ends_with("fixtures.yaml"));
    }
}
