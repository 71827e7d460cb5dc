//! Worktree mode: creates a fresh git worktree on a named
//! branch for the duration of a run, redirecting the session's effective
//! cwd. Uses `git2` rather than shelling out to `git`, matching the
//! session registry's own VCS detection (`session::detect_vcs_state`).

use std::sync::Arc;

use chrono::Utc;

use crate::error::{MaestroError, Result};
use crate::ids::SessionId;
use crate::session::SessionRegistry;

use super::playbook::WorktreeSettings;

/// Expand `{{DATE}}` in a branch template and create a worktree for the
/// session's repository, redirecting the session's effective working
/// directory to it for the duration of the run.
///
/// Returns the branch name on success. Worktree cleanup on abort is
/// best-effort; the branch is left for the user.
pub async fn prepare(
    registry: &Arc<SessionRegistry>,
    session_id: &SessionId,
    settings: &WorktreeSettings,
) -> Result<Option<String>> {
    let session = registry
        .get(session_id)
        .await
        .ok_or_else(|| MaestroError::SessionNotFound(session_id.to_string()))?;

    let branch_name = settings
        .branch_template
        .replace("{{DATE}}", &Utc::now().format("%Y-%m-%d").to_string())
        .replace("{{SESSION_NAME}}", &session.display_name);

    // git2's worktree "name" (distinct from the branch ref name) must not
    // contain path separators, so sanitize it for the `.maestro-worktrees/`
    // directory entry while keeping the full templated name as the branch.
    let worktree_name = branch_name.replace('/', "-");
    let repo_path = session.working_directory.clone();
    let worktree_path = repo_path
        .parent()
        .unwrap_or(&repo_path)
        .join(".maestro-worktrees")
        .join(&worktree_name);

    let branch_name_for_git = branch_name.clone();
    let worktree_name_for_git = worktree_name.clone();
    let worktree_path_for_git = worktree_path.clone();
    let result = tokio::task::spawn_blocking(move || {
        create_git_worktree(&repo_path, &branch_name_for_git, &worktree_name_for_git, &worktree_path_for_git)
    })
    .await
    .map_err(|e| MaestroError::PersistenceFailure {
        what: "worktree creation task".to_string(),
        cause: e.to_string(),
    })?;

    match result {
        Ok(()) => {
            registry
                .mutate(session_id, {
                    let worktree_path = worktree_path.clone();
                    move |s| {
                        s.working_directory = worktree_path;
                        Ok(())
                    }
                })
                .await?;
            Ok(Some(branch_name))
        }
        Err(e) => {
            tracing::warn!(error = %e, "worktree creation failed; running in the original working directory");
            Ok(None)
        }
    }
}

fn create_git_worktree(
    repo_path: &std::path::Path,
    branch_name: &str,
    worktree_name: &str,
    worktree_path: &std::path::Path,
) -> Result<()> {
    let repo = git2::Repository::discover(repo_path).map_err(|e| MaestroError::PersistenceFailure {
        what: "open repository for worktree".to_string(),
        cause: e.to_string(),
    })?;

    let head_commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| MaestroError::PersistenceFailure {
            what: "resolve HEAD commit".to_string(),
            cause: e.to_string(),
        })?;

    if repo.find_branch(branch_name, git2::BranchType::Local).is_err() {
        repo.branch(branch_name, &head_commit, false)
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "create branch".to_string(),
                cause: e.to_string(),
            })?;
    }

    repo.worktree(
        worktree_name,
        worktree_path,
        Some(git2::WorktreeAddOptions::new().reference(
            repo.find_reference(&format!("refs/heads/{branch_name}")).ok().as_ref(),
        )),
    )
    .map_err(|e| MaestroError::PersistenceFailure {
        what: "create worktree".to_string(),
        cause: e.to_string(),
    })?;

    Ok(())
}

/// Whether a pull request should be opened against `target_branch` once
/// the run ends.
/// The core never calls out to GitHub itself — that is an external
/// collaborator (the leaderboard/PR HTTP client); this just
/// decides *whether* the caller should.
pub fn should_open_pr(settings: &WorktreeSettings) -> Option<&str> {
    settings.create_pr.then_some(settings.target_branch.as_str())
}
