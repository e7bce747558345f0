//! Context retrieval for prompt augmentation.
//!
//! Documents are split into heading- or paragraph-sized chunks and ranked
//! against the query with a tf-idf style score. The built-in knowledge base
//! covers common Terraform conventions so retrieval is useful without any
//! configured documents.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::models::Scenario;

const MAX_CHUNK_CHARS: usize = 1500;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "create", "for", "from", "i", "in", "is",
    "it", "me", "need", "of", "on", "or", "please", "that", "the", "this", "to", "want", "with",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextDocument {
    pub source: String,
    pub title: String,
    pub content: String,
    pub score: f32,
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        scenario: Scenario,
        top_k: usize,
    ) -> Result<Vec<ContextDocument>>;
}

#[derive(Debug, Clone)]
struct Chunk {
    source: String,
    title: String,
    content: String,
    terms: HashMap<String, usize>,
}

/// In-memory keyword index over document chunks.
#[derive(Debug, Default)]
pub struct KeywordRetriever {
    chunks: Vec<Chunk>,
    doc_freq: HashMap<String, usize>,
}

impl KeywordRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// A retriever preloaded with the built-in Terraform guides.
    pub fn with_builtin() -> Self {
        let mut retriever = Self::new();
        for (title, body) in BUILTIN_GUIDES {
            retriever.add_chunk("builtin", title, body);
        }
        retriever
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Index every `.md`, `.tf` and `.txt` file under `dir`. Returns the number
    /// of chunks added.
    pub fn index_dir(&mut self, dir: &Path) -> Result<usize> {
        let before = self.chunks.len();
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let indexable = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "md" | "tf" | "txt"));
            if !indexable {
                continue;
            }
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let source = path
                .strip_prefix(dir)
                .unwrap_or(path)
                .to_string_lossy()
                .to_string();
            self.add_document(&source, &text);
        }
        Ok(self.chunks.len() - before)
    }

    /// Split a document into chunks at markdown headings, falling back to
    /// blank-line paragraphs for oversized sections.
    pub fn add_document(&mut self, source: &str, text: &str) {
        let mut title = source.to_string();
        let mut current = String::new();
        let mut sections: Vec<(String, String)> = Vec::new();

        for line in text.lines() {
            if let Some(heading) = line.strip_prefix('#') {
                if !current.trim().is_empty() {
                    sections.push((title.clone(), std::mem::take(&mut current)));
                }
                current.clear();
                title = heading.trim_start_matches('#').trim().to_string();
                continue;
            }
            current.push_str(line);
            current.push('\n');
        }
        if !current.trim().is_empty() {
            sections.push((title, current));
        }

        for (title, body) in sections {
            if body.len() <= MAX_CHUNK_CHARS {
                self.add_chunk(source, &title, body.trim());
                continue;
            }
            let mut piece = String::new();
            for para in body.split("\n\n") {
                if !piece.is_empty() && piece.len() + para.len() > MAX_CHUNK_CHARS {
                    self.add_chunk(source, &title, piece.trim());
                    piece.clear();
                }
                piece.push_str(para);
                piece.push_str("\n\n");
            }
            if !piece.trim().is_empty() {
                self.add_chunk(source, &title, piece.trim());
            }
        }
    }

    fn add_chunk(&mut self, source: &str, title: &str, content: &str) {
        let mut terms: HashMap<String, usize> = HashMap::new();
        for term in tokenize(title).into_iter().chain(tokenize(content)) {
            *terms.entry(term).or_default() += 1;
        }
        for term in terms.keys() {
            *self.doc_freq.entry(term.clone()).or_default() += 1;
        }
        self.chunks.push(Chunk {
            source: source.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            terms,
        });
    }

    /// Rank chunks against `query`. Chunks with no matching term are omitted.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<ContextDocument> {
        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() || self.chunks.is_empty() {
            return Vec::new();
        }
        let n = self.chunks.len() as f32;

        let mut scored: Vec<(f32, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(idx, chunk)| {
                let score: f32 = query_terms
                    .iter()
                    .filter_map(|term| {
                        let tf = *chunk.terms.get(term)? as f32;
                        let df = *self.doc_freq.get(term).unwrap_or(&1) as f32;
                        Some((1.0 + tf.ln()) * (1.0 + n / df).ln())
                    })
                    .sum();
                (score > 0.0).then_some((score, idx))
            })
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(top_k)
            .map(|(score, idx)| {
                let chunk = &self.chunks[idx];
                ContextDocument {
                    source: chunk.source.clone(),
                    title: chunk.title.clone(),
                    content: chunk.content.clone(),
                    score,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ContextRetriever for KeywordRetriever {
    async fn retrieve(
        &self,
        query: &str,
        scenario: Scenario,
        top_k: usize,
    ) -> Result<Vec<ContextDocument>> {
        // Scenario words steer toward module/variable/output guides.
        let augmented = match scenario {
            Scenario::NewModule => format!("{} module structure versions", query),
            Scenario::NewVariables => format!("{} variable type description validation", query),
            Scenario::NewOutputs => format!("{} output description sensitive", query),
            Scenario::NewResource | Scenario::ModifyResource => query.to_string(),
        };
        Ok(self.search(&augmented, top_k))
    }
}

/// Lowercased terms; underscore identifiers contribute both the whole
/// identifier and its parts (`aws_s3_bucket` → `aws_s3_bucket`, `aws`, `s3`, `bucket`).
fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        let word = word.trim_matches('_').to_lowercase();
        if word.len() < 2 {
            continue;
        }
        if word.contains('_') {
            for part in word.split('_') {
                if part.len() >= 2 && !STOPWORDS.contains(&part) {
                    out.push(part.to_string());
                }
            }
        }
        if !STOPWORDS.contains(&word.as_str()) {
            out.push(word);
        }
    }
    out
}

const BUILTIN_GUIDES: &[(&str, &str)] = &[
    (
        "Provider and version pinning",
        "Declare required_version and required_providers in a terraform block (versions.tf). \
         Pin providers with pessimistic constraints such as `~> 5.0` for hashicorp/aws, \
         hashicorp/azurerm and hashicorp/google so upgrades are deliberate.",
    ),
    (
        "Variables",
        "Every variable should declare a type and a description. Use validation blocks for \
         constrained values (CIDR ranges, environment names). Mark secrets with sensitive = true \
         and never give credentials a default value.",
    ),
    (
        "Outputs",
        "Every output should have a description. Outputs exposing secrets, connection strings or \
         passwords must set sensitive = true. Output identifiers (id, arn, name) that callers of a \
         module need rather than whole resource objects.",
    ),
    (
        "Tagging",
        "Apply a consistent tags map (Environment, Project, Owner, ManagedBy = terraform) to every \
         taggable resource. Prefer a local.common_tags merged with resource-specific tags, or the \
         AWS provider default_tags block.",
    ),
    (
        "S3 bucket hardening",
        "For aws_s3_bucket use separate aws_s3_bucket_versioning, \
         aws_s3_bucket_server_side_encryption_configuration and \
         aws_s3_bucket_public_access_block resources. Block all public access unless the bucket \
         hosts a public website, and enable versioning for state or data buckets.",
    ),
    (
        "Network security groups",
        "aws_security_group rules should follow least privilege. Avoid ingress from 0.0.0.0/0 \
         except for ports 80/443 on public load balancers. Describe every rule and restrict SSH \
         (22) and RDP (3389) to known CIDR ranges or bastion security groups.",
    ),
    (
        "IAM least privilege",
        "aws_iam_policy documents should avoid Action = \"*\" and Resource = \"*\". Prefer \
         aws_iam_policy_document data sources over inline JSON strings and scope actions to the \
         specific ARNs the workload touches.",
    ),
    (
        "Module structure",
        "A module directory contains main.tf (resources), variables.tf (inputs), outputs.tf \
         (outputs) and versions.tf (terraform and provider requirements). Modules must not \
         configure providers themselves; callers pass providers in.",
    ),
    (
        "Naming conventions",
        "Resource and data source labels, variables and outputs use snake_case. Do not repeat the \
         resource type in the label (aws_instance.web, not aws_instance.web_instance). Use \
         `this` for the single primary resource of a module.",
    ),
    (
        "Remote state",
        "Store state remotely with locking: an s3 backend with a dynamodb_table for locks, \
         azurerm backend with a storage account container, or gcs backend. Never commit \
         terraform.tfstate files.",
    ),
    (
        "Databases",
        "aws_db_instance should set storage_encrypted = true, backup_retention_period > 0, \
         deletion_protection = true for production, and read the master password from a \
         sensitive variable or a secrets manager rather than a literal.",
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_identifiers() {
        let terms = tokenize("Create an aws_s3_bucket for logs");
        assert!(terms.contains(&"aws_s3_bucket".to_string()));
        assert!(terms.contains(&"s3".to_string()));
        assert!(terms.contains(&"bucket".to_string()));
        assert!(terms.contains(&"logs".to_string()));
        assert!(!terms.contains(&"an".to_string()));
        assert!(!terms.contains(&"create".to_string()));
    }

    #[test]
    fn test_builtin_search_ranks_relevant_guide_first() {
        let retriever = KeywordRetriever::with_builtin();
        let docs = retriever.search("private s3 bucket with versioning", 3);
        assert!(!docs.is_empty());
        assert_eq!(docs[0].title, "S3 bucket hardening");
        assert!(docs.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_search_respects_top_k_and_skips_unrelated() {
        let retriever = KeywordRetriever::with_builtin();
        assert!(retriever.search("security group ingress", 1).len() == 1);
        assert!(retriever.search("zzzz qqqq", 5).is_empty());
        assert!(retriever.search("", 5).is_empty());
    }

    #[test]
    fn test_add_document_chunks_by_heading() {
        let mut retriever = KeywordRetriever::new();
        retriever.add_document(
            "guide.md",
            "# Kubernetes\nUse aws_eks_cluster for clusters.\n\n## Node groups\nUse aws_eks_node_group.\n",
        );
        assert_eq!(retriever.len(), 2);
        let docs = retriever.search("eks node group", 1);
        assert_eq!(docs[0].title, "Node groups");
        assert_eq!(docs[0].source, "guide.md");
    }

    #[test]
    fn test_add_document_splits_oversized_sections() {
        let mut retriever = KeywordRetriever::new();
        let para = "lambda function runtime memory timeout ".repeat(30);
        let body = format!("# Lambda\n{}\n\n{}\n\n{}\n", para, para, para);
        retriever.add_document("lambda.md", &body);
        assert!(retriever.len() >= 2);
    }

    #[test]
    fn test_index_dir_reads_supported_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("net.md"), "# VPC\nUse aws_vpc with cidr_block.").unwrap();
        std::fs::write(dir.path().join("example.tf"), "resource \"aws_vpc\" \"this\" {}").unwrap();
        std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();
        let mut retriever = KeywordRetriever::new();
        let added = retriever.index_dir(dir.path()).unwrap();
        assert_eq!(added, 2);
        let docs = retriever.search("vpc cidr", 5);
        assert!(docs.iter().any(|d| d.source == "net.md"));
    }

    #[tokio::test]
    async fn test_retrieve_steers_by_scenario() {
        let retriever = KeywordRetriever::with_builtin();
        let docs = retriever
            .retrieve("network", Scenario::NewOutputs, 2)
            .await
            .unwrap();
        assert!(docs.iter().any(|d| d.title == "Outputs"));
    }
}
