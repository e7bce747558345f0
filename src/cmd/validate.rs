//! Offline validation command: `tfgen validate`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

use tfgen::generate::validator::{Validator, read_tf_files};

pub fn cmd_validate(path: &Path, lenient: bool, json: bool) -> Result<()> {
    let files = if path.is_dir() {
        read_tf_files(path)?
    } else {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "main.tf".to_string());
        BTreeMap::from([(name, content)])
    };
    if files.is_empty() {
        bail!("No .tf files found in {}", path.display());
    }

    let validator = if lenient { Validator::lenient() } else { Validator::new() };
    let result = validator.validate(&files);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for violation in &result.violations {
            println!("{}", violation.describe());
        }
        println!(
            "{} file(s) checked: {} error(s), {} warning(s), {} info",
            result.files_checked, result.error_count, result.warning_count, result.info_count
        );
    }

    if !result.passed {
        bail!("Validation failed with {} error(s)", result.error_count);
    }
    Ok(())
}
