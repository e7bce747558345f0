//! Best-practice recommendations for Terraform resources.
//!
//! A static rule catalog keyed by resource type prefix. `advise` lists the
//! rules for a resource type; `review` checks the rules against actual code
//! and reports only the ones that are not yet followed.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::models::Severity;
use super::validator::{Block, top_level_blocks};

/// How a rule decides it is already satisfied.
#[derive(Debug, Clone, Copy)]
enum Check {
    /// Attribute or nested block present in the resource body
    Has(&'static str),
    /// Attribute set to this literal
    Equals(&'static str, &'static str),
    /// Another resource of this type exists anywhere in the file set
    Companion(&'static str),
    AnyOf(&'static [Check]),
}

struct Rule {
    id: &'static str,
    applies_to: &'static [&'static str],
    title: &'static str,
    advice: &'static str,
    severity: Severity,
    check: Check,
}

const TAGGABLE: &[&str] = &[
    "aws_s3_bucket",
    "aws_instance",
    "aws_vpc",
    "aws_subnet",
    "aws_db_instance",
    "aws_security_group",
    "aws_lb",
    "aws_ebs_volume",
    "aws_dynamodb_table",
    "aws_lambda_function",
];

static RULES: &[Rule] = &[
    Rule {
        id: "s3-versioning",
        applies_to: &["aws_s3_bucket"],
        title: "Enable bucket versioning",
        advice: "Add an aws_s3_bucket_versioning resource with status = \"Enabled\" to protect against accidental deletes.",
        severity: Severity::Warning,
        check: Check::AnyOf(&[Check::Companion("aws_s3_bucket_versioning"), Check::Has("versioning")]),
    },
    Rule {
        id: "s3-encryption",
        applies_to: &["aws_s3_bucket"],
        title: "Encrypt bucket contents",
        advice: "Add an aws_s3_bucket_server_side_encryption_configuration using aws:kms or AES256.",
        severity: Severity::Warning,
        check: Check::AnyOf(&[
            Check::Companion("aws_s3_bucket_server_side_encryption_configuration"),
            Check::Has("server_side_encryption_configuration"),
        ]),
    },
    Rule {
        id: "s3-public-access-block",
        applies_to: &["aws_s3_bucket"],
        title: "Block public access",
        advice: "Add an aws_s3_bucket_public_access_block with all four flags set to true.",
        severity: Severity::Warning,
        check: Check::Companion("aws_s3_bucket_public_access_block"),
    },
    Rule {
        id: "db-storage-encrypted",
        applies_to: &["aws_db_instance", "aws_rds_cluster"],
        title: "Encrypt database storage",
        advice: "Set storage_encrypted = true, optionally with a customer managed kms_key_id.",
        severity: Severity::Warning,
        check: Check::Equals("storage_encrypted", "true"),
    },
    Rule {
        id: "db-backups",
        applies_to: &["aws_db_instance", "aws_rds_cluster"],
        title: "Retain automated backups",
        advice: "Set backup_retention_period to at least 7 days.",
        severity: Severity::Info,
        check: Check::Has("backup_retention_period"),
    },
    Rule {
        id: "db-deletion-protection",
        applies_to: &["aws_db_instance", "aws_rds_cluster"],
        title: "Enable deletion protection",
        advice: "Set deletion_protection = true for production databases.",
        severity: Severity::Info,
        check: Check::Equals("deletion_protection", "true"),
    },
    Rule {
        id: "ec2-imdsv2",
        applies_to: &["aws_instance", "aws_launch_template"],
        title: "Require IMDSv2",
        advice: "Add metadata_options { http_tokens = \"required\" }.",
        severity: Severity::Warning,
        check: Check::Equals("http_tokens", "\"required\""),
    },
    Rule {
        id: "ebs-encryption",
        applies_to: &["aws_ebs_volume"],
        title: "Encrypt EBS volumes",
        advice: "Set encrypted = true.",
        severity: Severity::Warning,
        check: Check::Equals("encrypted", "true"),
    },
    Rule {
        id: "sg-description",
        applies_to: &["aws_security_group", "aws_security_group_rule", "aws_vpc_security_group_ingress_rule"],
        title: "Describe security group rules",
        advice: "Give every security group and rule a description explaining its purpose.",
        severity: Severity::Info,
        check: Check::Has("description"),
    },
    Rule {
        id: "kms-rotation",
        applies_to: &["aws_kms_key"],
        title: "Rotate KMS keys",
        advice: "Set enable_key_rotation = true.",
        severity: Severity::Warning,
        check: Check::Equals("enable_key_rotation", "true"),
    },
    Rule {
        id: "log-retention",
        applies_to: &["aws_cloudwatch_log_group"],
        title: "Bound log retention",
        advice: "Set retention_in_days so logs don't accumulate forever.",
        severity: Severity::Info,
        check: Check::Has("retention_in_days"),
    },
    Rule {
        id: "azure-storage-tls",
        applies_to: &["azurerm_storage_account"],
        title: "Require TLS 1.2",
        advice: "Set min_tls_version = \"TLS1_2\".",
        severity: Severity::Warning,
        check: Check::Equals("min_tls_version", "\"TLS1_2\""),
    },
    Rule {
        id: "gcs-uniform-access",
        applies_to: &["google_storage_bucket"],
        title: "Use uniform bucket-level access",
        advice: "Set uniform_bucket_level_access = true.",
        severity: Severity::Warning,
        check: Check::Equals("uniform_bucket_level_access", "true"),
    },
    Rule {
        id: "tagging",
        applies_to: TAGGABLE,
        title: "Tag resources",
        advice: "Add tags (Name, Environment, Owner) or configure default_tags on the provider.",
        severity: Severity::Info,
        check: Check::AnyOf(&[Check::Has("tags"), Check::Has("default_tags")]),
    },
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Recommendation {
    pub rule_id: String,
    pub title: String,
    pub advice: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BestPracticeReport {
    pub recommendations: Vec<Recommendation>,
    pub resources_reviewed: usize,
    /// Share of applicable checks already satisfied, 0-100
    pub score: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BestPracticeAdvisor;

struct Resource<'a> {
    file: &'a str,
    block: Block,
}

impl BestPracticeAdvisor {
    pub fn new() -> Self {
        Self
    }

    /// All rules that apply to `resource_type`, plus the configuration-wide ones.
    pub fn advise(&self, resource_type: &str) -> Vec<Recommendation> {
        let mut out: Vec<Recommendation> = RULES
            .iter()
            .filter(|r| r.applies_to.contains(&resource_type))
            .map(|r| recommendation(r, None, None, None))
            .collect();
        out.extend(general_recommendations());
        out
    }

    /// Check `files` against the catalog and return the unmet rules.
    pub fn review(&self, files: &BTreeMap<String, String>) -> BestPracticeReport {
        let resources: Vec<Resource<'_>> = files
            .iter()
            .flat_map(|(name, content)| {
                top_level_blocks(content)
                    .into_iter()
                    .filter(|b| b.kind == "resource" && b.labels.len() == 2)
                    .map(move |block| Resource { file: name, block })
            })
            .collect();
        let types: BTreeSet<&str> = resources.iter().map(|r| r.block.labels[0].as_str()).collect();
        let provider_default_tags = files.values().any(|c| c.contains("default_tags"));

        let mut recommendations = Vec::new();
        let (mut applicable, mut satisfied) = (0usize, 0usize);
        for resource in &resources {
            let rtype = resource.block.labels[0].as_str();
            for rule in RULES.iter().filter(|r| r.applies_to.contains(&rtype)) {
                applicable += 1;
                let ok = (rule.id == "tagging" && provider_default_tags)
                    || is_satisfied(&rule.check, &resource.block, &types);
                if ok {
                    satisfied += 1;
                    continue;
                }
                recommendations.push(recommendation(
                    rule,
                    Some(format!("{}.{}", rtype, resource.block.labels[1])),
                    Some(resource.file),
                    Some(resource.block.line),
                ));
            }
        }

        let all_code: String = files.values().map(String::as_str).collect::<Vec<_>>().join("\n");
        if !resources.is_empty() {
            applicable += 2;
            if all_code.contains("required_providers") {
                satisfied += 1;
            } else {
                recommendations.push(general_recommendations().remove(0));
            }
            if all_code.contains("backend \"") {
                satisfied += 1;
            } else {
                recommendations.push(general_recommendations().remove(1));
            }
        }

        let score = if applicable == 0 {
            100
        } else {
            ((satisfied * 100) / applicable) as u8
        };
        BestPracticeReport {
            recommendations,
            resources_reviewed: resources.len(),
            score,
        }
    }
}

fn general_recommendations() -> Vec<Recommendation> {
    vec![
        Recommendation {
            rule_id: "pin-providers".into(),
            title: "Pin provider versions".into(),
            advice: "Declare required_providers with version constraints in a terraform block.".into(),
            severity: Severity::Warning,
            resource: None,
            file: None,
            line: None,
        },
        Recommendation {
            rule_id: "remote-state".into(),
            title: "Use a remote state backend".into(),
            advice: "Configure a backend (s3 + dynamodb locking, azurerm, gcs) instead of local state.".into(),
            severity: Severity::Info,
            resource: None,
            file: None,
            line: None,
        },
    ]
}

fn recommendation(
    rule: &Rule,
    resource: Option<String>,
    file: Option<&str>,
    line: Option<usize>,
) -> Recommendation {
    Recommendation {
        rule_id: rule.id.to_string(),
        title: rule.title.to_string(),
        advice: rule.advice.to_string(),
        severity: rule.severity,
        resource,
        file: file.map(str::to_string),
        line,
    }
}

fn is_satisfied(check: &Check, block: &Block, types: &BTreeSet<&str>) -> bool {
    match check {
        Check::Has(name) => block.has_attribute(name) || has_nested_block(block, name),
        Check::Equals(name, value) => block.body_lines().any(|(_, line)| {
            line.split_once('=')
                .is_some_and(|(k, v)| k.trim() == *name && v.trim() == *value)
        }),
        Check::Companion(rtype) => types.contains(rtype),
        Check::AnyOf(checks) => checks.iter().any(|c| is_satisfied(c, block, types)),
    }
}

fn has_nested_block(block: &Block, name: &str) -> bool {
    block.body.iter().any(|line| {
        line.trim_start()
            .strip_prefix(name)
            .is_some_and(|rest| rest.trim_start().starts_with('{'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(content: &str) -> BTreeMap<String, String> {
        let mut f = BTreeMap::new();
        f.insert("main.tf".to_string(), content.to_string());
        f
    }

    #[test]
    fn test_advise_lists_rules_for_type() {
        let recs = BestPracticeAdvisor::new().advise("aws_s3_bucket");
        let ids: Vec<_> = recs.iter().map(|r| r.rule_id.as_str()).collect();
        assert!(ids.contains(&"s3-versioning"));
        assert!(ids.contains(&"s3-public-access-block"));
        assert!(ids.contains(&"tagging"));
        assert!(ids.contains(&"pin-providers"));
        assert!(!ids.contains(&"kms-rotation"));
    }

    #[test]
    fn test_advise_unknown_type_gets_general_advice() {
        let recs = BestPracticeAdvisor::new().advise("null_resource");
        assert_eq!(recs.len(), 2);
    }

    #[test]
    fn test_review_reports_unmet_rules() {
        let code = r#"
resource "aws_s3_bucket" "logs" {
  bucket = "logs"
}

resource "aws_s3_bucket_versioning" "logs" {
  bucket = aws_s3_bucket.logs.id
  versioning_configuration {
    status = "Enabled"
  }
}
"#;
        let report = BestPracticeAdvisor::new().review(&files(code));
        let ids: Vec<_> = report.recommendations.iter().map(|r| r.rule_id.as_str()).collect();
        assert!(!ids.contains(&"s3-versioning"));
        assert!(ids.contains(&"s3-encryption"));
        assert!(ids.contains(&"tagging"));
        assert!(ids.contains(&"pin-providers"));
        assert_eq!(report.resources_reviewed, 2);
        let enc = report.recommendations.iter().find(|r| r.rule_id == "s3-encryption").unwrap();
        assert_eq!(enc.resource.as_deref(), Some("aws_s3_bucket.logs"));
        assert_eq!(enc.line, Some(2));
        assert!(report.score > 0 && report.score < 100);
    }

    #[test]
    fn test_review_equals_and_nested_blocks() {
        let code = r#"
terraform {
  required_providers {
    aws = { source = "hashicorp/aws", version = "~> 5.0" }
  }
  backend "s3" {}
}

resource "aws_instance" "web" {
  ami = "ami-123"
  metadata_options {
    http_tokens = "required"
  }
  tags = { Name = "web" }
}
"#;
        let report = BestPracticeAdvisor::new().review(&files(code));
        assert!(report.recommendations.is_empty(), "{:?}", report.recommendations);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn test_review_of_empty_set() {
        let report = BestPracticeAdvisor::new().review(&BTreeMap::new());
        assert!(report.recommendations.is_empty());
        assert_eq!(report.score, 100);
    }
}
