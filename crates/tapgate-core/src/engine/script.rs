use crate::model::{SchemaSnapshot, SqlDialect};

/// Builds the single combined script handed to an executor.
///
/// Layout: DDL, extension enabling (PostgreSQL only), `BEGIN;`, the test
/// SQL in order, `ROLLBACK;`. The rollback is always emitted.
#[derive(Debug, Clone, Default)]
pub struct ScriptBuilder {
    ddl: String,
    extensions: Vec<String>,
    dialect: SqlDialect,
    tests: Vec<String>,
}

impl ScriptBuilder {
    pub fn for_schema(schema: &SchemaSnapshot) -> Self {
        Self {
            ddl: schema.ddl.clone(),
            extensions: schema.extensions.clone(),
            dialect: schema.dialect,
            tests: Vec::new(),
        }
    }

    pub fn test(mut self, sql: &str) -> Self {
        let sql = sql.trim();
        if !sql.is_empty() {
            self.tests.push(sql.to_string());
        }
        self
    }

    pub fn tests<'a>(self, sqls: impl IntoIterator<Item = &'a str>) -> Self {
        sqls.into_iter().fold(self, |b, sql| b.test(sql))
    }

    pub fn test_count(&self) -> usize {
        self.tests.len()
    }

    pub fn build(&self) -> String {
        let mut out = String::new();

        let ddl = self.ddl.trim();
        if !ddl.is_empty() {
            out.push_str(&terminated(ddl));
            out.push('\n');
        }

        if self.dialect == SqlDialect::Postgres {
            for ext in &self.extensions {
                out.push_str(&format!(
                    "CREATE EXTENSION IF NOT EXISTS \"{}\";\n",
                    ext.replace('"', "\"\"")
                ));
            }
        }

        out.push_str("BEGIN;\n");
        for sql in &self.tests {
            out.push_str(&terminated(sql));
            out.push('\n');
        }
        out.push_str("ROLLBACK;\n");
        out
    }
}

fn terminated(sql: &str) -> String {
    if sql.ends_with(';') {
        sql.to_string()
    } else {
        format!("{};", sql)
    }
}
