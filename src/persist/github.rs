//! Publish generated files to a GitHub repository as one commit.
//!
//! Uses the Git Data API so a set of files lands in a single commit without a
//! local clone: resolve the branch head, write a tree on top of it, commit,
//! then move the ref.

use std::collections::BTreeMap;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::GithubSection;
use crate::errors::PersistenceError;
use crate::generate::models::GithubStatus;

const USER_AGENT: &str = "tfgen";
const API_VERSION: &str = "2022-11-28";

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    full_name: String,
    html_url: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
}

pub struct GithubPublisher {
    client: reqwest::Client,
    api_url: String,
    token: String,
    owner: Option<String>,
    branch: String,
    private: bool,
}

impl GithubPublisher {
    pub fn new(section: &GithubSection, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: section.api_url.trim_end_matches('/').to_string(),
            token,
            owner: section.owner.clone(),
            branch: section.branch.clone(),
            private: section.private,
        }
    }

    /// `None` when no token is configured.
    pub fn from_config(section: &GithubSection) -> Option<Self> {
        section.resolved_token().map(|token| Self::new(section, token))
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<Option<T>, PersistenceError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PersistenceError::GitHub(format!(
                "{} failed with status {}: {}",
                what,
                status.as_u16(),
                body.trim()
            )));
        }
        Ok(Some(resp.json::<T>().await?))
    }

    async fn require<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, PersistenceError> {
        self.send(req, what)
            .await?
            .ok_or_else(|| PersistenceError::GitHub(format!("{} returned 404", what)))
    }

    async fn ensure_repo(&self, repo_name: &str) -> Result<GitHubRepo, PersistenceError> {
        let login = self
            .require::<GitHubUser>(self.request(Method::GET, "/user"), "Fetching user")
            .await?
            .login;
        let owner = self.owner.clone().unwrap_or_else(|| login.clone());

        let existing = self
            .send::<GitHubRepo>(
                self.request(Method::GET, &format!("/repos/{}/{}", owner, repo_name)),
                "Fetching repository",
            )
            .await?;
        if let Some(repo) = existing {
            return Ok(repo);
        }

        let path = if owner == login {
            "/user/repos".to_string()
        } else {
            format!("/orgs/{}/repos", owner)
        };
        info!(repo = %format!("{}/{}", owner, repo_name), "Creating GitHub repository");
        let body = json!({
            "name": repo_name,
            "private": self.private,
            "auto_init": true,
            "description": "Terraform generated by tfgen",
        });
        self.require(self.request(Method::POST, &path).json(&body), "Creating repository")
            .await
    }

    /// Commit `files` to the configured branch of `repo_name`, creating the
    /// repository (and the branch) when missing.
    pub async fn publish(
        &self,
        repo_name: &str,
        message: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<GithubStatus, PersistenceError> {
        let repo = self.ensure_repo(repo_name).await?;
        let full = repo.full_name.clone();

        let branch_ref = self
            .send::<GitRef>(
                self.request(Method::GET, &format!("/repos/{}/git/ref/heads/{}", full, self.branch)),
                "Fetching branch",
            )
            .await?;
        let (parent_sha, branch_exists) = match branch_ref {
            Some(r) => (r.object.sha, true),
            None => {
                let base: GitRef = self
                    .require(
                        self.request(
                            Method::GET,
                            &format!("/repos/{}/git/ref/heads/{}", full, repo.default_branch),
                        ),
                        "Fetching default branch",
                    )
                    .await?;
                (base.object.sha, false)
            }
        };

        let parent: GitCommit = self
            .require(
                self.request(Method::GET, &format!("/repos/{}/git/commits/{}", full, parent_sha)),
                "Fetching head commit",
            )
            .await?;

        let entries: Vec<_> = files
            .iter()
            .map(|(path, content)| {
                json!({ "path": path, "mode": "100644", "type": "blob", "content": content })
            })
            .collect();
        let tree: GitObject = self
            .require(
                self.request(Method::POST, &format!("/repos/{}/git/trees", full))
                    .json(&json!({ "base_tree": parent.tree.sha, "tree": entries })),
                "Creating tree",
            )
            .await?;

        let commit: GitObject = self
            .require(
                self.request(Method::POST, &format!("/repos/{}/git/commits", full)).json(&json!({
                    "message": message,
                    "tree": tree.sha,
                    "parents": [parent.sha],
                })),
                "Creating commit",
            )
            .await?;

        if branch_exists {
            let _: serde_json::Value = self
                .require(
                    self.request(Method::PATCH, &format!("/repos/{}/git/refs/heads/{}", full, self.branch))
                        .json(&json!({ "sha": commit.sha, "force": false })),
                    "Updating branch",
                )
                .await?;
        } else {
            let _: serde_json::Value = self
                .require(
                    self.request(Method::POST, &format!("/repos/{}/git/refs", full)).json(&json!({
                        "ref": format!("refs/heads/{}", self.branch),
                        "sha": commit.sha,
                    })),
                    "Creating branch",
                )
                .await?;
        }

        debug!(repo = %full, sha = %commit.sha, "Pushed generated files");
        Ok(GithubStatus {
            pushed: true,
            repository: Some(full),
            commit_sha: Some(commit.sha),
            url: Some(repo.html_url),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorded {
        calls: Arc<Mutex<Vec<(String, Value)>>>,
        repo_exists: bool,
    }

    impl Recorded {
        fn push(&self, what: &str, body: Value) {
            self.calls.lock().unwrap().push((what.to_string(), body));
        }
    }

    async fn mock_github(repo_exists: bool) -> (String, Recorded) {
        let rec = Recorded {
            repo_exists,
            ..Default::default()
        };
        let app = Router::new()
            .route("/user", get(|| async { Json(json!({ "login": "octo" })) }))
            .route(
                "/repos/{owner}/{repo}",
                get(|State(rec): State<Recorded>, Path((owner, repo)): Path<(String, String)>| async move {
                    if rec.repo_exists {
                        (
                            StatusCode::OK,
                            Json(json!({
                                "full_name": format!("{}/{}", owner, repo),
                                "html_url": format!("https://github.com/{}/{}", owner, repo),
                                "default_branch": "main",
                            })),
                        )
                    } else {
                        (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" })))
                    }
                }),
            )
            .route(
                "/user/repos",
                post(|State(rec): State<Recorded>, Json(body): Json<Value>| async move {
                    rec.push("create_repo", body.clone());
                    Json(json!({
                        "full_name": format!("octo/{}", body["name"].as_str().unwrap_or("")),
                        "html_url": "https://github.com/octo/new",
                        "default_branch": "main",
                    }))
                }),
            )
            .route(
                "/repos/{owner}/{repo}/git/ref/heads/{branch}",
                get(|| async { Json(json!({ "object": { "sha": "c1" } })) }),
            )
            .route(
                "/repos/{owner}/{repo}/git/commits/{sha}",
                get(|| async { Json(json!({ "sha": "c1", "tree": { "sha": "t1" } })) }),
            )
            .route(
                "/repos/{owner}/{repo}/git/trees",
                post(|State(rec): State<Recorded>, Json(body): Json<Value>| async move {
                    rec.push("tree", body);
                    Json(json!({ "sha": "t2" }))
                }),
            )
            .route(
                "/repos/{owner}/{repo}/git/commits",
                post(|State(rec): State<Recorded>, Json(body): Json<Value>| async move {
                    rec.push("commit", body);
                    Json(json!({ "sha": "c2" }))
                }),
            )
            .route(
                "/repos/{owner}/{repo}/git/refs/heads/{branch}",
                patch(|State(rec): State<Recorded>, Json(body): Json<Value>| async move {
                    rec.push("update_ref", body);
                    Json(json!({ "object": { "sha": "c2" } }))
                }),
            )
            .with_state(rec.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), rec)
    }

    fn publisher(api_url: String) -> GithubPublisher {
        let section = GithubSection {
            api_url,
            ..GithubSection::default()
        };
        GithubPublisher::new(&section, "ghp_test".to_string())
    }

    fn files() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("main.tf".to_string(), "resource \"a\" \"b\" {}\n".to_string()),
            ("variables.tf".to_string(), String::new()),
        ])
    }

    #[tokio::test]
    async fn test_publish_creates_repo_and_commits() {
        let (url, rec) = mock_github(false).await;
        let status = publisher(url).publish("my-vpc", "Add vpc", &files()).await.unwrap();

        assert!(status.pushed);
        assert_eq!(status.repository.as_deref(), Some("octo/my-vpc"));
        assert_eq!(status.commit_sha.as_deref(), Some("c2"));

        let calls = rec.calls.lock().unwrap();
        let names: Vec<&str> = calls.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["create_repo", "tree", "commit", "update_ref"]);
        assert_eq!(calls[0].1["auto_init"], true);
        assert_eq!(calls[1].1["base_tree"], "t1");
        assert_eq!(calls[1].1["tree"].as_array().unwrap().len(), 2);
        assert_eq!(calls[2].1["parents"][0], "c1");
        assert_eq!(calls[3].1["sha"], "c2");
    }

    #[tokio::test]
    async fn test_publish_reuses_existing_repo() {
        let (url, rec) = mock_github(true).await;
        let status = publisher(url).publish("infra", "Update", &files()).await.unwrap();
        assert_eq!(status.repository.as_deref(), Some("octo/infra"));
        let calls = rec.calls.lock().unwrap();
        assert!(calls.iter().all(|(n, _)| n != "create_repo"));
    }

    #[tokio::test]
    async fn test_publish_reports_api_failure() {
        let app = Router::new().route(
            "/user",
            get(|| async { (StatusCode::UNAUTHORIZED, "Bad credentials") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let err = publisher(format!("http://{}", addr))
            .publish("x", "m", &files())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"), "{}", err);
    }

    #[test]
    fn test_from_config_requires_token() {
        let section = GithubSection {
            token: Some("  ".to_string()),
            ..GithubSection::default()
        };
        // Whitespace tokens are treated as unset, env fallback aside.
        if std::env::var("GITHUB_TOKEN").is_err() {
            assert!(GithubPublisher::from_config(&section).is_none());
        }
        let section = GithubSection {
            token: Some("ghp_abc".to_string()),
            ..GithubSection::default()
        };
        assert!(GithubPublisher::from_config(&section).is_some());
    }
}
