//! Build checks the orchestrator runs itself during Validation.
//!
//! Java repositories with a `build.gradle` get `gradle test`, and every JUnit
//! test case becomes a `ValidationCheck` next to the worker's own checks.
//! Check names are prefixed with the repository name.

pub mod gradle;

pub use gradle::GradleRunner;

use crate::config::{Language, PipelineConfig};
use crate::schema::ValidationCheck;
use tracing::{debug, info, warn};

/// Build checks for every Java repository, in configuration order.
///
/// Never fails: a build that cannot run is reported as a failed
/// `gradle-build` check for that repository.
pub async fn run_build_checks(config: &PipelineConfig) -> Vec<ValidationCheck> {
    if !config.options.build_checks {
        return Vec::new();
    }

    let mut checks = Vec::new();
    for repo in config
        .repositories
        .iter()
        .filter(|r| r.language == Language::Java)
    {
        let runner = match GradleRunner::new(config.repo_path(repo), &config.options.gradle_cmd) {
            Ok(runner) => runner,
            Err(err) => {
                debug!(repo = %repo.name, "Skipping build check: {}", err);
                continue;
            }
        };

        info!(repo = %repo.name, cmd = %config.options.gradle_cmd, "Running build check");
        let timeout = config.phase_timeout();
        let repo_checks = match tokio::time::timeout(timeout, runner.run_tests(&[])).await {
            Ok(Ok(checks)) => checks,
            Ok(Err(err)) => {
                warn!(repo = %repo.name, error = %err, "Build check could not run");
                vec![gradle::failed_build(err.to_string())]
            }
            Err(_) => {
                warn!(repo = %repo.name, "Build check timed out");
                vec![gradle::failed_build(format!(
                    "no result within {}s",
                    timeout.as_secs()
                ))]
            }
        };

        let failed = repo_checks.iter().filter(|c| !c.passed).count();
        info!(repo = %repo.name, checks = repo_checks.len(), failed, "Build check finished");
        checks.extend(repo_checks.into_iter().map(|mut check| {
            check.check_name = format!("{}:{}", repo.name, check.check_name);
            check
        }));
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
project_name = "storefront"
work_dir = "unused"

[[repositories]]
name = "web"
url = "git@github.com:example/web.git"
branch = "main"
language = "javascript"

[[repositories]]
name = "api"
url = "git@github.com:example/api.git"
branch = "main"
language = "java"
"#;

    fn config(root: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig::parse_toml(CONFIG).unwrap();
        config.work_dir = root.join("work");
        config.repositories[0].path = Some(root.join("web"));
        config.repositories[1].path = Some(root.join("api"));
        config
    }

    #[tokio::test]
    async fn test_skips_repositories_without_gradle_project() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        fs::create_dir_all(dir.path().join("api")).unwrap();
        // A build.gradle in a JavaScript repository is not a Java build.
        fs::create_dir_all(dir.path().join("web")).unwrap();
        fs::write(dir.path().join("web/build.gradle"), "// stub").unwrap();

        assert!(run_build_checks(&config).await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_build_checks_run_nothing() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.options.build_checks = false;
        config.options.gradle_cmd = "definitely-not-gradle".to_string();
        fs::create_dir_all(dir.path().join("api")).unwrap();
        fs::write(dir.path().join("api/build.gradle"), "// stub").unwrap();

        assert!(run_build_checks(&config).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_gradle_becomes_failed_check() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.options.gradle_cmd = "definitely-not-gradle".to_string();
        fs::create_dir_all(dir.path().join("api")).unwrap();
        fs::write(dir.path().join("api/build.gradle"), "// stub").unwrap();

        let checks = run_build_checks(&config).await;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].check_name, "api:gradle-build");
        assert!(!checks[0].passed);
        assert!(checks[0].details.contains("definitely-not-gradle"));
    }
}
