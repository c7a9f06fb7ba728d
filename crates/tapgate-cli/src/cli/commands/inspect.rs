use super::exit_codes;
use crate::cli::args::{ClassifyArgs, ParseArgs, ValidateArgs};
use anyhow::Context;
use tapgate_core::generate::{validate_candidate, CandidateShape};
use tapgate_core::model::SqlDialect;
use tokio::io::AsyncReadExt;

pub async fn cmd_validate(args: ValidateArgs) -> anyhow::Result<i32> {
    let dialect = match args.dialect.as_str() {
        "sqlite" => SqlDialect::Sqlite,
        "postgres" | "postgresql" => SqlDialect::Postgres,
        other => {
            eprintln!("config error: unknown dialect '{}' (expected sqlite|postgres)", other);
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };

    let sql = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    match validate_candidate(&sql, dialect) {
        Ok(CandidateShape::AssertionScript) => {
            println!("valid: assertion script");
            Ok(exit_codes::OK)
        }
        Ok(CandidateShape::Statements(n)) => {
            println!("valid: {} statement(s)", n);
            Ok(exit_codes::OK)
        }
        Err(violations) => {
            println!("invalid:");
            for v in violations {
                println!("  - {}", v);
            }
            Ok(exit_codes::TEST_FAILED)
        }
    }
}

pub async fn cmd_parse(args: ParseArgs) -> anyhow::Result<i32> {
    let input = match args.file.as_deref() {
        Some(p) if p.as_os_str() != "-" => tokio::fs::read_to_string(p)
            .await
            .with_context(|| format!("failed to read {}", p.display()))?,
        _ => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let summary = tapgate_core::tap::parse(&input);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed > 0 {
        Ok(exit_codes::TEST_FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

pub fn cmd_classify(args: ClassifyArgs) -> anyhow::Result<i32> {
    let c = tapgate_core::classify::classify(&args.message);
    println!("{}", serde_json::to_string_pretty(&c)?);
    Ok(exit_codes::OK)
}
