use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

/// Source of the current branch name for a working directory.
pub trait GitProbe {
    fn current_branch(&self, cwd: &Path) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandGit;

impl GitProbe for CommandGit {
    fn current_branch(&self, cwd: &Path) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(cwd)
            .arg("rev-parse")
            .arg("--abbrev-ref")
            .arg("HEAD")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                debug!(error = %err, cwd = %cwd.display(), "git unavailable");
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        branch_from_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Detached checkouts report `HEAD`, which is not a branch.
fn branch_from_output(stdout: &str) -> Option<String> {
    let branch = stdout.trim();
    (!branch.is_empty() && branch != "HEAD").then(|| branch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_rev_parse_output() {
        assert_eq!(branch_from_output("main\n").as_deref(), Some("main"));
        assert_eq!(
            branch_from_output("feature/context-bars\n").as_deref(),
            Some("feature/context-bars")
        );
        assert_eq!(branch_from_output("HEAD\n"), None);
        assert_eq!(branch_from_output("  \n"), None);
    }

    #[test]
    fn non_repository_has_no_branch() {
        let tmp = TempDir::new().expect("temp dir");
        assert_eq!(CommandGit.current_branch(tmp.path()), None);
    }
}
