//! Command-line tests for the tfgen binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn tfgen(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("tfgen");
    cmd.current_dir(dir.path())
        .env_remove("TFGEN_CONFIG_DIR")
        .env_remove("TFGEN_PORT")
        .env_remove("TFGEN_PROVIDER")
        .env_remove("TFGEN_MODEL")
        .env_remove("TFGEN_LLM_BASE_URL")
        .env_remove("RUST_LOG");
    cmd
}

const VALID_TF: &str = r#"variable "name" {
  description = "Bucket name"
  type        = string
}

resource "aws_s3_bucket" "logs" {
  bucket = var.name
}
"#;

// =============================================================================
// Basics
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("generate"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir).arg("deploy").assert().failure();
    }
}

// =============================================================================
// validate
// =============================================================================

mod validate {
    use super::*;

    #[test]
    fn test_valid_directory_passes() {
        let dir = TempDir::new().unwrap();
        let tf = dir.path().join("infra");
        fs::create_dir(&tf).unwrap();
        fs::write(tf.join("main.tf"), VALID_TF).unwrap();

        tfgen(&dir)
            .args(["validate", "infra"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 file(s) checked: 0 error(s)"));
    }

    #[test]
    fn test_unbalanced_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("broken.tf"),
            "resource \"aws_vpc\" \"main\" {\n  cidr_block = \"10.0.0.0/16\"\n",
        )
        .unwrap();

        tfgen(&dir)
            .args(["validate", "broken.tf"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("unclosed"))
            .stderr(predicate::str::contains("Validation failed"));
    }

    #[test]
    fn test_json_output() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.tf"), VALID_TF).unwrap();

        let output = tfgen(&dir)
            .args(["validate", "main.tf", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(result["passed"], true);
        assert_eq!(result["files_checked"], 1);
    }

    #[test]
    fn test_lenient_ignores_undeclared_variables() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("main.tf"),
            "resource \"aws_s3_bucket\" \"b\" {\n  bucket = var.missing\n}\n",
        )
        .unwrap();

        tfgen(&dir).args(["validate", "main.tf"]).assert().failure();
        tfgen(&dir)
            .args(["validate", "main.tf", "--lenient"])
            .assert()
            .success();
    }

    #[test]
    fn test_empty_directory_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        tfgen(&dir)
            .args(["validate", "empty"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No .tf files"));
    }
}

// =============================================================================
// config
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_show_defaults() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("showing defaults"))
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("port = 8080"));
    }

    #[test]
    fn test_init_then_validate() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote"));
        assert!(dir.path().join(".tfgen/tfgen.toml").exists());

        tfgen(&dir)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));

        tfgen(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("conf");
        fs::create_dir(&config_dir).unwrap();
        fs::write(
            config_dir.join("tfgen.toml"),
            "[jobs]\nmax_concurrent = 0\n\n[auth]\nrequired = true\n",
        )
        .unwrap();

        tfgen(&dir)
            .args(["--config-dir", "conf", "config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("jobs.max_concurrent"))
            .stdout(predicate::str::contains("auth.required"));
    }
}

// =============================================================================
// generate
// =============================================================================

mod generate {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::json;

    #[test]
    fn test_rejects_empty_query() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir)
            .args(["generate", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("query must not be empty"));
    }

    #[test]
    fn test_rejects_unknown_scenario() {
        let dir = TempDir::new().unwrap();
        tfgen(&dir)
            .args(["generate", "a bucket", "--scenario", "rewrite_everything"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid scenario"));
    }

    const REPLY: &str = "## main.tf\nresource \"aws_s3_bucket\" \"logs\" {\n  bucket = var.name\n}\n\n## variables.tf\nvariable \"name\" {\n  description = \"Bucket name\"\n  type        = string\n}\n\n## outputs.tf\noutput \"arn\" {\n  description = \"Bucket ARN\"\n  value       = aws_s3_bucket.logs.arn\n}\n";

    /// An OpenAI-compatible endpoint that always answers with `REPLY`.
    async fn fake_llm() -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(json!({
                    "model": "fake-model",
                    "choices": [{ "message": { "role": "assistant", "content": REPLY } }],
                    "usage": { "prompt_tokens": 120, "completion_tokens": 80 }
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_generates_files_from_llm_reply() {
        let base_url = fake_llm().await;
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".tfgen")).unwrap();
        fs::write(
            dir.path().join(".tfgen/tfgen.toml"),
            format!(
                "[llm]\ndefault_provider = \"local\"\nmax_retries = 0\n\n[llm.providers.local]\nkind = \"openai\"\nmodel = \"fake-model\"\nbase_url = \"{}\"\n",
                base_url
            ),
        )
        .unwrap();

        let out = dir.path().join("out");
        let dir = tokio::task::spawn_blocking(move || {
            tfgen(&dir)
                .args(["generate", "an s3 bucket for logs", "--output", "out"])
                .assert()
                .success()
                .stdout(predicate::str::contains("Wrote 3 file(s)"))
                .stdout(predicate::str::contains("Tokens: 120 prompt, 80 completion"));
            dir
        })
        .await
        .unwrap();

        let main_tf = fs::read_to_string(out.join("main.tf")).unwrap();
        assert!(main_tf.contains("aws_s3_bucket"));
        assert!(out.join("variables.tf").exists());
        assert!(out.join("outputs.tf").exists());
        drop(dir);
    }
}
