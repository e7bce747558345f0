//! Prompt construction for generation, correction and clarification.

use std::collections::BTreeMap;

use serde::Serialize;

use super::context::ContextDocument;
use super::models::{GenerationRequest, Scenario, Violation};

/// Per-document cap so one large reference can't crowd out the query.
const MAX_CONTEXT_DOC_CHARS: usize = 2000;

pub const SYSTEM_PROMPT: &str = r#"You are a senior infrastructure engineer who writes production-quality Terraform (HCL).

Rules:
- Produce complete, valid HCL that passes `terraform validate`.
- Every variable has a type and a description; every output has a description.
- Mark secrets as sensitive and never hard-code credentials.
- Use snake_case names and consistent tags on taggable resources.
- Pin provider versions in a terraform block when you create versions.tf.

Output format:
For EACH requested file, write a markdown header line with the exact file name,
followed by the file content in a fenced ```hcl code block. Example:

## main.tf
```hcl
resource "aws_s3_bucket" "this" {
  bucket = var.bucket_name
}
```

Do not add files that were not requested. Do not add prose between files."#;

/// Clarification instructions appended when the caller allows a round-trip.
pub const CLARIFICATION_INSTRUCTIONS: &str = r#"If, and only if, the request is too ambiguous to implement safely (for example the cloud provider cannot be inferred), reply with ONLY this JSON object and nothing else:
{"clarification_needed": true, "questions": ["question 1", "question 2"]}
Otherwise produce the files directly."#;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineeredPrompt {
    pub system: String,
    pub user: String,
    pub expected_files: Vec<String>,
}

impl EngineeredPrompt {
    pub fn char_len(&self) -> usize {
        self.system.len() + self.user.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptEngineer;

impl PromptEngineer {
    pub fn new() -> Self {
        Self
    }

    /// Build the generation prompt for a request and its retrieved context.
    pub fn build(
        &self,
        request: &GenerationRequest,
        context: &[ContextDocument],
    ) -> Result<EngineeredPrompt, String> {
        request.check()?;
        let expected_files = request.expected_files();

        let mut user = String::new();
        user.push_str("## Task\n\n");
        user.push_str(scenario_instructions(request.scenario));
        user.push_str("\n\n## Request\n\n");
        user.push_str(request.query.trim());
        user.push_str("\n\n");

        if let Some(existing) = request.existing_code.as_deref().filter(|c| !c.trim().is_empty()) {
            let label = request.target_file_path.as_deref().unwrap_or("existing code");
            user.push_str(&format!(
                "## Existing code ({})\n\n```hcl\n{}\n```\n\n",
                label,
                existing.trim_end()
            ));
        }

        if !context.is_empty() {
            user.push_str("## Reference material\n\n");
            for doc in context {
                user.push_str(&format!(
                    "### {} ({})\n{}\n\n",
                    doc.title,
                    doc.source,
                    truncate_chars(&doc.content, MAX_CONTEXT_DOC_CHARS)
                ));
            }
        }

        user.push_str("## Files to produce\n\n");
        for file in &expected_files {
            user.push_str(&format!("- {}\n", file));
        }

        let mut system = SYSTEM_PROMPT.to_string();
        if request.allow_clarification {
            system.push_str("\n\n");
            system.push_str(CLARIFICATION_INSTRUCTIONS);
        }

        Ok(EngineeredPrompt {
            system,
            user,
            expected_files,
        })
    }

    /// Re-prompt after a clarification round. `answer == None` means the
    /// caller never replied and the model should pick sensible defaults.
    pub fn with_clarification(
        &self,
        original: &EngineeredPrompt,
        questions: &[String],
        answer: Option<&str>,
    ) -> EngineeredPrompt {
        let mut user = original.user.clone();
        user.push_str("\n## Clarification\n\n");
        for q in questions {
            user.push_str(&format!("Q: {}\n", q));
        }
        match answer {
            Some(a) => user.push_str(&format!("A: {}\n", a.trim())),
            None => user.push_str(
                "A: No answer was provided. Make reasonable, clearly commented assumptions.\n",
            ),
        }
        user.push_str("\nDo not ask further questions; produce the files now.\n");

        EngineeredPrompt {
            // Drop the clarification invitation so the model can't ask again.
            system: SYSTEM_PROMPT.to_string(),
            user,
            expected_files: original.expected_files.clone(),
        }
    }

    /// Prompt asking the model to fix the listed validation errors.
    pub fn correction(
        &self,
        files: &BTreeMap<String, String>,
        errors: &[&Violation],
        expected_files: &[String],
    ) -> EngineeredPrompt {
        let mut user = String::from(
            "The following Terraform files failed validation. Fix every error listed below \
             while preserving the intent of the code. Return ALL files, complete, in the same \
             format (one `## <file name>` header followed by a fenced hcl block per file).\n\n",
        );
        user.push_str("## Validation errors\n\n");
        for (i, err) in errors.iter().enumerate() {
            user.push_str(&format!("{}. {}\n", i + 1, err.describe()));
        }
        user.push_str("\n## Current files\n\n");
        for name in expected_files {
            let content = files.get(name).map(String::as_str).unwrap_or("");
            user.push_str(&format!("## {}\n```hcl\n{}\n```\n\n", name, content.trim_end()));
        }
        EngineeredPrompt {
            system: SYSTEM_PROMPT.to_string(),
            user,
            expected_files: expected_files.to_vec(),
        }
    }
}

fn scenario_instructions(scenario: Scenario) -> &'static str {
    match scenario {
        Scenario::NewResource => {
            "Create new Terraform resources for the request below, with the input variables \
             and outputs they need."
        }
        Scenario::ModifyResource => {
            "Modify the existing Terraform code below to satisfy the request. Return the full \
             updated file, not a diff."
        }
        Scenario::NewModule => {
            "Create a reusable Terraform module for the request below, including provider \
             version constraints."
        }
        Scenario::NewVariables => {
            "Write Terraform variable declarations for the request below, with types, \
             descriptions, defaults where safe, and validation blocks where useful."
        }
        Scenario::NewOutputs => {
            "Write Terraform output declarations for the request below, with descriptions and \
             sensitive flags where appropriate."
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
