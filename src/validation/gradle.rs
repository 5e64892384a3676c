//! `gradle test` runner and JUnit XML report parsing.

use crate::errors::BuildCheckError;
use crate::schema::{Extra, ValidationCheck};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Where Gradle writes JUnit reports, relative to the project root.
pub const TEST_RESULTS_DIR: &str = "build/test-results/test";

/// Check reported when a build leaves no test cases behind.
pub const BUILD_CHECK: &str = "gradle-build";

const MAX_DETAIL_CHARS: usize = 500;

/// Runs a Gradle project's tests and reads back its JUnit reports.
pub struct GradleRunner {
    repo_path: PathBuf,
    gradle_cmd: String,
}

impl GradleRunner {
    /// `repo_path` must contain a `build.gradle`.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        gradle_cmd: impl Into<String>,
    ) -> Result<Self, BuildCheckError> {
        let repo_path = repo_path.into();
        if !repo_path.join("build.gradle").is_file() {
            return Err(BuildCheckError::NoBuildFile { path: repo_path });
        }
        Ok(Self {
            repo_path,
            gradle_cmd: gradle_cmd.into(),
        })
    }

    pub fn report_dir(&self) -> PathBuf {
        self.repo_path.join(TEST_RESULTS_DIR)
    }

    /// One check per test case, or a single `gradle-build` check when the
    /// build produced no reports (a compile error, for example).
    pub async fn run_tests(
        &self,
        extra_args: &[String],
    ) -> Result<Vec<ValidationCheck>, BuildCheckError> {
        let (success, output) = self.invoke(extra_args).await?;
        let checks = self.parse_reports()?;
        Ok(with_build_outcome(checks, success, &output))
    }

    async fn invoke(&self, extra_args: &[String]) -> Result<(bool, String), BuildCheckError> {
        let output = Command::new(&self.gradle_cmd)
            .args(["test", "--daemon", "--continue"])
            .args(extra_args)
            .current_dir(&self.repo_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BuildCheckError::Spawn {
                cmd: self.gradle_cmd.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        debug!(path = %self.repo_path.display(), status = %output.status, "gradle test exited");
        Ok((output.status.success(), text))
    }

    /// Checks from every `*.xml` report, files in name order. Unreadable or
    /// malformed reports are skipped.
    pub fn parse_reports(&self) -> Result<Vec<ValidationCheck>, BuildCheckError> {
        let dir = self.report_dir();
        let pattern = format!("{}/*.xml", glob::Pattern::escape(&dir.to_string_lossy()));
        let paths = glob::glob(&pattern).map_err(|source| BuildCheckError::Reports {
            path: dir.clone(),
            source,
        })?;

        let mut checks = Vec::new();
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable test report");
                    continue;
                }
            };
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(report = %path.display(), error = %err, "Skipping unreadable test report");
                    continue;
                }
            };
            match parse_junit_xml(&content) {
                Ok(parsed) => checks.extend(parsed),
                Err(err) => {
                    warn!(report = %path.display(), error = %err, "Skipping malformed test report")
                }
            }
        }
        Ok(checks)
    }
}

fn check(name: impl Into<String>, passed: bool, details: impl Into<String>) -> ValidationCheck {
    ValidationCheck {
        check_name: name.into(),
        passed,
        details: details.into(),
        extra: Extra::new(),
    }
}

/// A `gradle-build` check that failed with `details`.
pub fn failed_build(details: impl Into<String>) -> ValidationCheck {
    check(BUILD_CHECK, false, details)
}

/// Never leave Validation without a check for this build.
pub fn with_build_outcome(
    mut checks: Vec<ValidationCheck>,
    success: bool,
    output: &str,
) -> Vec<ValidationCheck> {
    if checks.is_empty() {
        if success {
            checks.push(check(BUILD_CHECK, true, "Build succeeded, no test cases found"));
        } else {
            checks.push(failed_build(output));
        }
    }
    checks
}

struct TestCase {
    name: String,
    skipped: bool,
    failed: bool,
    message: Option<String>,
    body: String,
    /// Inside the first `<failure>`/`<error>` element, which has no message
    in_failure: bool,
}

impl TestCase {
    fn into_check(self) -> ValidationCheck {
        if self.skipped {
            // Disabled tests do not block Validation.
            return check(self.name, true, "SKIPPED");
        }
        if self.failed {
            let message = self
                .message
                .unwrap_or_else(|| self.body.trim().to_string());
            let details: String = message.chars().take(MAX_DETAIL_CHARS).collect();
            return check(self.name, false, details);
        }
        check(self.name, true, "PASSED")
    }
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, quick_xml::Error> {
    match element.try_get_attribute(name)? {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

/// Handle an opening tag. Returns the finished check for a self-closing
/// `<testcase/>`.
fn open(
    case: &mut Option<TestCase>,
    element: &BytesStart<'_>,
    empty: bool,
) -> Result<Option<ValidationCheck>, quick_xml::Error> {
    match element.name().as_ref() {
        b"testcase" => {
            let class_name = attribute(element, "classname")?.unwrap_or_default();
            let test_name = attribute(element, "name")?.unwrap_or_default();
            let opened = TestCase {
                name: format!("{}.{}", class_name, test_name),
                skipped: false,
                failed: false,
                message: None,
                body: String::new(),
                in_failure: false,
            };
            if empty {
                return Ok(Some(opened.into_check()));
            }
            *case = Some(opened);
        }
        b"failure" | b"error" => {
            if let Some(case) = case.as_mut()
                && !case.failed
            {
                case.failed = true;
                case.message = attribute(element, "message")?;
                case.in_failure = !empty && case.message.is_none();
            }
        }
        b"skipped" => {
            if let Some(case) = case.as_mut() {
                case.skipped = true;
            }
        }
        _ => {}
    }
    Ok(None)
}

/// One check per `<testcase>`, named `<classname>.<name>`.
pub fn parse_junit_xml(xml: &str) -> Result<Vec<ValidationCheck>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut checks = Vec::new();
    let mut case: Option<TestCase> = None;

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                if let Some(done) = open(&mut case, &element, false)? {
                    checks.push(done);
                }
            }
            Event::Empty(element) => {
                if let Some(done) = open(&mut case, &element, true)? {
                    checks.push(done);
                }
            }
            Event::Text(text) => {
                if let Some(case) = case.as_mut()
                    && case.in_failure
                {
                    case.body.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(case) = case.as_mut()
                    && case.in_failure
                {
                    case.body.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(element) => match element.name().as_ref() {
                b"testcase" => {
                    if let Some(done) = case.take() {
                        checks.push(done.into_check());
                    }
                }
                b"failure" | b"error" => {
                    if let Some(case) = case.as_mut() {
                        case.in_failure = false;
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    fn gradle_project() -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("build.gradle"), "// stub").unwrap();
        dir
    }

    fn write_report(project: &Path, name: &str, xml: &str) {
        let dir = project.join(TEST_RESULTS_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), xml).unwrap();
    }

    #[test]
    fn test_new_requires_build_gradle() {
        let dir = tempdir().unwrap();
        let err = GradleRunner::new(dir.path(), "gradle").err().unwrap();
        assert!(matches!(err, BuildCheckError::NoBuildFile { .. }));
        assert!(err.to_string().contains("No build.gradle"));

        let project = gradle_project();
        let runner = GradleRunner::new(project.path(), "gradle").unwrap();
        assert_eq!(runner.report_dir(), project.path().join(TEST_RESULTS_DIR));
    }

    #[test]
    fn test_passing_cases_become_passed_checks() {
        let checks = parse_junit_xml(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="com.example.ApiClientTest" tests="3">
  <testcase classname="com.example.ApiClientTest" name="T1 base url configured" time="0.012"/>
  <testcase classname="com.example.ApiClientTest" name="T2 base url not hardcoded" time="0.008"/>
  <testcase classname="com.example.ApiClientTest" name="T3 getUser calls /api/v1/users/{id}" time="0.105">
  </testcase>
</testsuite>"#,
        )
        .unwrap();

        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| c.passed && c.details == "PASSED"));
        assert_eq!(
            checks[0].check_name,
            "com.example.ApiClientTest.T1 base url configured"
        );
        assert!(checks[2].check_name.contains("T3"));
    }

    #[test]
    fn test_failure_message_is_unescaped() {
        let checks = parse_junit_xml(
            r#"<testsuite name="com.example.ApiClientTest" tests="1" failures="1">
  <testcase classname="com.example.ApiClientTest" name="T2" time="0.001">
    <failure message="expected: &lt;https://api.example.com&gt; but was: &lt;hardcoded&gt;">
      org.opentest4j.AssertionFailedError: expected: ...
    </failure>
  </testcase>
</testsuite>"#,
        )
        .unwrap();

        assert_eq!(checks.len(), 1);
        assert!(!checks[0].passed);
        assert_eq!(
            checks[0].details,
            "expected: <https://api.example.com> but was: <hardcoded>"
        );
    }

    #[test]
    fn test_error_without_message_uses_body_capped() {
        let long = "x".repeat(800);
        let xml = format!(
            r#"<testsuite><testcase classname="C" name="boom"><error>
  java.lang.NullPointerException {long}
</error></testcase></testsuite>"#
        );
        let checks = parse_junit_xml(&xml).unwrap();

        assert!(!checks[0].passed);
        assert!(checks[0].details.starts_with("java.lang.NullPointerException"));
        assert_eq!(checks[0].details.chars().count(), MAX_DETAIL_CHARS);
    }

    #[test]
    fn test_skipped_case_does_not_fail() {
        let checks = parse_junit_xml(
            r#"<testsuite tests="1" skipped="1">
  <testcase classname="com.example.ApiClientTest" name="T5 disabled"><skipped/></testcase>
</testsuite>"#,
        )
        .unwrap();

        assert_eq!(checks.len(), 1);
        assert!(checks[0].passed);
        assert_eq!(checks[0].details, "SKIPPED");
    }

    #[test]
    fn test_reports_are_aggregated_in_name_order() {
        let project = gradle_project();
        write_report(
            project.path(),
            "TEST-ApiClientTest.xml",
            r#"<testsuite><testcase classname="com.example.ApiClientTest" name="T1"/></testsuite>"#,
        );
        write_report(
            project.path(),
            "TEST-AnotherTest.xml",
            r#"<testsuite>
  <testcase classname="com.example.AnotherTest" name="A1"/>
  <testcase classname="com.example.AnotherTest" name="A2"/>
</testsuite>"#,
        );
        write_report(project.path(), "notes.txt", "not a report");

        let runner = GradleRunner::new(project.path(), "gradle").unwrap();
        let names: Vec<String> = runner
            .parse_reports()
            .unwrap()
            .into_iter()
            .map(|c| c.check_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "com.example.AnotherTest.A1",
                "com.example.AnotherTest.A2",
                "com.example.ApiClientTest.T1"
            ]
        );
    }

    #[test]
    fn test_missing_report_dir_yields_no_checks() {
        let project = gradle_project();
        let runner = GradleRunner::new(project.path(), "gradle").unwrap();
        assert!(runner.parse_reports().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_report_is_skipped() {
        let project = gradle_project();
        write_report(
            project.path(),
            "TEST-Broken.xml",
            r#"<testsuite><testcase classname="Broken" name="x"></testsuite>"#,
        );
        write_report(
            project.path(),
            "TEST-Good.xml",
            r#"<testsuite><testcase classname="Good" name="ok"/></testsuite>"#,
        );

        let runner = GradleRunner::new(project.path(), "gradle").unwrap();
        let checks = runner.parse_reports().unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].check_name, "Good.ok");
    }

    #[test]
    fn test_build_outcome_fills_in_missing_checks() {
        let failed = with_build_outcome(Vec::new(), false, "error: package does not exist");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].check_name, BUILD_CHECK);
        assert!(!failed[0].passed);
        assert!(failed[0].details.contains("package does not exist"));

        let passed = with_build_outcome(Vec::new(), true, "");
        assert!(passed[0].passed);

        let existing = vec![check("C.t", true, "PASSED")];
        assert_eq!(with_build_outcome(existing.clone(), false, "boom"), existing);
    }

    // `sh test --daemon --continue` runs the project's `test` file as a
    // script, standing in for Gradle.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tests_reports_compile_failure() {
        let project = gradle_project();
        fs::write(
            project.path().join("test"),
            "echo 'error: package com.example.client does not exist' >&2\nexit 1\n",
        )
        .unwrap();

        let runner = GradleRunner::new(project.path(), "sh").unwrap();
        let checks = runner.run_tests(&[]).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].check_name, BUILD_CHECK);
        assert!(!checks[0].passed);
        assert!(checks[0].details.contains("does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tests_reads_reports_written_by_build() {
        let project = gradle_project();
        fs::write(
            project.path().join("test"),
            format!(
                "mkdir -p {dir}\n\
                 echo '<testsuite><testcase classname=\"C\" name=\"t\"/></testsuite>' > {dir}/TEST-C.xml\n",
                dir = TEST_RESULTS_DIR
            ),
        )
        .unwrap();

        let runner = GradleRunner::new(project.path(), "sh").unwrap();
        let checks = runner.run_tests(&[]).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].check_name, "C.t");
        assert!(checks[0].passed);
    }
}
