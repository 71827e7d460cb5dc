//! Playbook model and markdown task extraction.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;

use crate::config::MaestroConfig;
use crate::error::{MaestroError, Result, ResultExt};
use crate::ids::{PlaybookId, SessionId};

/// Worktree-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSettings {
    /// Branch naming template, e.g. `autorun/{{DATE}}-{{SESSION_NAME}}`.
    pub branch_template: String,
    pub create_pr: bool,
    pub target_branch: String,
}

/// A user-authored batch specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: PlaybookId,
    pub display_name: String,
    /// Document references, relative to the session's Auto Run folder.
    pub documents: Vec<PathBuf>,
    pub loop_enabled: bool,
    pub max_loops: Option<u32>,
    pub override_prompt: Option<String>,
    pub worktree: Option<WorktreeSettings>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Playbook {
    pub fn new(display_name: String, documents: Vec<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: PlaybookId::new(),
            display_name,
            documents,
            loop_enabled: false,
            max_loops: None,
            override_prompt: None,
            worktree: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Serialized form of `playbooks/<session-id>.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PlaybooksFile {
    playbooks: Vec<Playbook>,
}

/// Per-session playbook store. A thin file-backed CRUD layer, separate
/// from the session registry's own persistence.
pub struct PlaybookStore {
    config: MaestroConfig,
}

impl PlaybookStore {
    pub fn new(config: MaestroConfig) -> Self {
        Self { config }
    }

    async fn load(&self, session_id: &SessionId) -> PlaybooksFile {
        let path = self.config.playbook_file(session_id.as_str());
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => PlaybooksFile::default(),
        }
    }

    async fn save(&self, session_id: &SessionId, file: &PlaybooksFile) -> Result<()> {
        let path = self.config.playbook_file(session_id.as_str());
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let contents = serde_json::to_string_pretty(file).map_err(|e| MaestroError::PersistenceFailure {
            what: "serialize playbook file".to_string(),
            cause: e.to_string(),
        })?;
        tokio::fs::write(&path, contents)
            .await
            .context_path("write playbook file", &path)
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "write playbook file".to_string(),
                cause: e.to_string(),
            })
    }

    pub async fn list(&self, session_id: &SessionId) -> Vec<Playbook> {
        self.load(session_id).await.playbooks
    }

    pub async fn get(&self, session_id: &SessionId, id: &PlaybookId) -> Option<Playbook> {
        self.load(session_id)
            .await
            .playbooks
            .into_iter()
            .find(|p| &p.id == id)
    }

    pub async fn upsert(&self, session_id: &SessionId, playbook: Playbook) -> Result<()> {
        let mut file = self.load(session_id).await;
        if let Some(existing) = file.playbooks.iter_mut().find(|p| p.id == playbook.id) {
            *existing = playbook;
        } else {
            file.playbooks.push(playbook);
        }
        self.save(session_id, &file).await
    }

    pub async fn delete(&self, session_id: &SessionId, id: &PlaybookId) -> Result<()> {
        let mut file = self.load(session_id).await;
        file.playbooks.retain(|p| &p.id != id);
        self.save(session_id, &file).await
    }
}

/// One extracted task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Line index within the document at plan time, used for best-effort
    /// matching at mark-done time.
    pub line_index: usize,
    pub indent: String,
    pub text: String,
}

/// Parse every unchecked `- [ ]` top-level task from a markdown document,
/// skipping lines inside fenced code blocks.
///
/// Recognizes `^(\s*)- \[[ xX]\] (.+)$`; only unchecked boxes (`[ ]`)
/// become tasks — a checked box is treated as an already-completed task
/// and skipped.
pub fn parse_tasks(markdown: &str) -> Vec<Task> {
    let task_re = Regex::new(r"^(\s*)-\s\[([ xX])\]\s+(.+)$").unwrap();
    let fence_re = Regex::new(r"^\s*```").unwrap();

    let mut tasks = Vec::new();
    let mut in_fence = false;
    for (index, line) in markdown.lines().enumerate() {
        if fence_re.is_match(line) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = task_re.captures(line) else {
            continue;
        };
        if caps.get(2).unwrap().as_str().eq_ignore_ascii_case("x") {
            continue;
        }
        tasks.push(Task {
            line_index: index,
            indent: caps.get(1).unwrap().as_str().to_string(),
            text: caps.get(3).unwrap().as_str().trim().to_string(),
        });
    }
    tasks
}

/// Mark the task at `expected_line_index` (whose text was `expected_text`
/// at plan time) done in `path`, rewriting the file in place.
///
/// Best-effort matching: if the captured line no longer matches, falls
/// back to a text search across the current file; if still not found,
/// logs a warning and proceeds, treating the task as done anyway so the
/// run doesn't stall on a drifted document.
pub async fn mark_task_done(path: &Path, expected_line_index: usize, expected_text: &str) -> Result<()> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .context_path("read playbook document", path)
        .map_err(|e| MaestroError::PersistenceFailure {
            what: "read playbook document".to_string(),
            cause: e.to_string(),
        })?;
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();

    let task_re = Regex::new(r"^(\s*)-\s\[([ xX])\]\s+(.+)$").unwrap();

    let already_checked = |line: &str| -> bool {
        task_re
            .captures(line)
            .map(|c| c.get(2).unwrap().as_str().eq_ignore_ascii_case("x"))
            .unwrap_or(false)
    };

    let line_matches = |line: &str| -> bool {
        task_re
            .captures(line)
            .map(|c| c.get(3).unwrap().as_str().trim() == expected_text)
            .unwrap_or(false)
    };

    if let Some(line) = lines.get(expected_line_index) {
        if already_checked(line) {
            return Ok(()); // Idempotent: already-checked lines are skipped.
        }
        if line_matches(line) {
            lines[expected_line_index] = check_line(line);
            return write_lines(path, &lines).await;
        }
    }

    tracing::warn!(
        path = %path.display(),
        expected_line_index,
        "playbook document diverged from plan; re-searching for task text"
    );
    if let Some((index, line)) = lines
        .iter()
        .enumerate()
        .find(|(_, l)| !already_checked(l) && line_matches(l))
    {
        let replaced = check_line(line);
        lines[index] = replaced;
        return write_lines(path, &lines).await;
    }

    tracing::warn!(
        path = %path.display(),
        task = expected_text,
        "task line not found at mark-done time; proceeding as done (best-effort)"
    );
    Ok(())
}

fn check_line(line: &str) -> String {
    // Flip exactly the checkbox marker, preserving indent and trailing text.
    let re = Regex::new(r"\[[ ]\]").unwrap();
    re.replacen(line, 1, "[x]").into_owned()
}

async fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut contents = lines.join("\n");
    contents.push('\n');
    tokio::fs::write(path, contents)
        .await
        .context_path("write playbook document", path)
        .map_err(|e| MaestroError::PersistenceFailure {
            what: "write playbook document".to_string(),
            cause: e.to_string(),
        })
}

/// Manifest stored at the root of an exported playbook zip.
#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub name: String,
    pub documents: Vec<PathBuf>,
    #[serde(rename = "loopEnabled")]
    pub loop_enabled: bool,
    #[serde(rename = "maxLoops")]
    pub max_loops: Option<u32>,
    pub prompt: Option<String>,
    #[serde(rename = "worktreeSettings")]
    pub worktree_settings: Option<WorktreeSettings>,
    #[serde(rename = "exportedAt")]
    pub exported_at: i64,
}

/// Export a playbook to a zip: `manifest.json` plus `documents/<file>.md`
/// for each referenced document.
pub fn export_zip(playbook: &Playbook, autorun_folder: &Path, out: &Path, exported_at_ms: i64) -> Result<()> {
    let manifest = Manifest {
        version: 1,
        name: playbook.display_name.clone(),
        documents: playbook.documents.clone(),
        loop_enabled: playbook.loop_enabled,
        max_loops: playbook.max_loops,
        prompt: playbook.override_prompt.clone(),
        worktree_settings: playbook.worktree.clone(),
        exported_at: exported_at_ms,
    };

    let file = std::fs::File::create(out).map_err(|e| MaestroError::PersistenceFailure {
        what: "create export zip".to_string(),
        cause: e.to_string(),
    })?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("manifest.json", options)
        .map_err(zip_err("start manifest.json"))?;
    let manifest_json = serde_json::to_string_pretty(&manifest).map_err(|e| MaestroError::PersistenceFailure {
        what: "serialize manifest.json".to_string(),
        cause: e.to_string(),
    })?;
    zip.write_all(manifest_json.as_bytes())
        .map_err(zip_err("write manifest.json"))?;

    for doc in &playbook.documents {
        let src = autorun_folder.join(doc);
        let Ok(mut contents) = std::fs::read(&src) else {
            // Missing referenced documents are silently dropped at export
            // time too, symmetric with import.
            tracing::warn!(doc = %doc.display(), "playbook document missing at export time, skipping");
            continue;
        };
        let entry_name = format!("documents/{}", doc.display());
        zip.start_file(&entry_name, options)
            .map_err(zip_err("start document entry"))?;
        zip.write_all(&mut contents).map_err(zip_err("write document entry"))?;
    }

    zip.finish().map_err(zip_err("finish zip"))?;
    Ok(())
}

/// Import a playbook zip into `target_autorun_folder`, regenerating the
/// playbook id and copying document files (overwriting). Documents the
/// manifest references but that are absent from the archive are silently
/// dropped.
pub fn import_zip(archive_path: &Path, target_autorun_folder: &Path) -> Result<Playbook> {
    let file = std::fs::File::open(archive_path).map_err(|e| MaestroError::PersistenceFailure {
        what: "open import zip".to_string(),
        cause: e.to_string(),
    })?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| MaestroError::PersistenceFailure {
        what: "read zip archive".to_string(),
        cause: e.to_string(),
    })?;

    let manifest: Manifest = {
        let mut entry = zip
            .by_name("manifest.json")
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "read manifest.json".to_string(),
                cause: e.to_string(),
            })?;
        let mut buf = String::new();
        entry
            .read_to_string(&mut buf)
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "read manifest.json".to_string(),
                cause: e.to_string(),
            })?;
        serde_json::from_str(&buf).map_err(|e| MaestroError::PersistenceFailure {
            what: "parse manifest.json".to_string(),
            cause: e.to_string(),
        })?
    };

    std::fs::create_dir_all(target_autorun_folder).map_err(|e| MaestroError::PersistenceFailure {
        what: "create Auto Run folder".to_string(),
        cause: e.to_string(),
    })?;

    let mut present_documents = Vec::new();
    for doc in &manifest.documents {
        let entry_name = format!("documents/{}", doc.display());
        let Ok(mut entry) = zip.by_name(&entry_name) else {
            continue; // Missing documents are silently dropped, not an error.
        };
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .map_err(|e| MaestroError::PersistenceFailure {
                what: "read document entry".to_string(),
                cause: e.to_string(),
            })?;
        let dest = target_autorun_folder.join(doc);
        if let Some(parent) = dest.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(&dest, buf).map_err(|e| MaestroError::PersistenceFailure {
            what: "write imported document".to_string(),
            cause: e.to_string(),
        })?;
        present_documents.push(doc.clone());
    }

    let now = Utc::now();
    Ok(Playbook {
        id: PlaybookId::new(),
        display_name: manifest.name,
        documents: present_documents,
        loop_enabled: manifest.loop_enabled,
        max_loops: manifest.max_loops,
        override_prompt: manifest.prompt,
        worktree: manifest.worktree_settings,
        created_at: now,
        updated_at: now,
    })
}

fn zip_err(op: &'static str) -> impl Fn(zip::result::ZipError) -> MaestroError {
    move |e| MaestroError::PersistenceFailure {
        what: op.to_string(),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unchecked_tasks_only() {
        let md = "# Fix imports\n- [ ] Consolidate duplicate imports in src/a.ts\n- [x] already done\n- [ ] Sort imports alphabetically in src/b.ts\n";
        let tasks = parse_tasks(md);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].text, "Consolidate duplicate imports in src/a.ts");
        assert_eq!(tasks[0].line_index, 1);
        assert_eq!(tasks[1].line_index, 3);
    }

    #[test]
    fn ignores_tasks_inside_fenced_code_blocks() {
        let md = "# doc\n```\n- [ ] not a real task\n```\n- [ ] real task\n";
        let tasks = parse_tasks(md);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].text, "real task");
    }

    #[test]
    fn empty_document_yields_zero_tasks() {
        assert!(parse_tasks("# nothing here\njust prose\n").is_empty());
    }

    #[tokio::test]
    async fn mark_task_done_flips_only_the_matching_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        tokio::fs::write(&path, "- [ ] one\n- [ ] two\n").await.unwrap();

        mark_task_done(&path, 0, "one").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "- [x] one\n- [ ] two\n");
    }

    #[tokio::test]
    async fn mark_task_done_falls_back_to_text_search_when_line_drifted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        // A line was inserted above the originally captured index.
        tokio::fs::write(&path, "- [ ] inserted\n- [ ] one\n- [ ] two\n")
            .await
            .unwrap();

        mark_task_done(&path, 0, "one").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "- [ ] inserted\n- [x] one\n- [ ] two\n");
    }

    #[tokio::test]
    async fn mark_task_done_is_idempotent_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        tokio::fs::write(&path, "- [x] one\n- [ ] two\n").await.unwrap();

        mark_task_done(&path, 0, "one").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "- [x] one\n- [ ] two\n");
    }
}
