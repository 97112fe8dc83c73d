//! Local directory indexing.
//!
//! `LocalDirWorker` walks a directory during planning and dispatches the
//! matching files as batched child jobs (`local_dir_batch`). The step job
//! stays running until those children settle. `LocalDirBatchExecutor` is
//! the consumer side: it reads each file in a batch and upserts it as a
//! document keyed by its relative path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Worker;
use crate::batching::{dispatch_batches, BatchDispatch};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::jobs::{JobExecutor, JobManager, LogLevel, QueueJob, PHASE_RUN};
use crate::policy::FailurePolicy;
use crate::traits::documents::DocumentStore;
use crate::types::{ConfigMap, Document, InitResult, JobDefinition, JobStep, WorkItem};

const WORKER_TYPE: &str = "local_dir";
pub const BATCH_JOB_TYPE: &str = "local_dir_batch";
const SOURCE_TYPE: &str = "local_dir";
const SUGGESTED_CONCURRENCY: usize = 5;

const DEFAULT_MAX_FILES: usize = 10_000;
const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

const DEFAULT_EXTENSIONS: &[&str] = &[
    ".go", ".ts", ".tsx", ".js", ".jsx", ".py", ".rs", ".java", ".md", ".yaml", ".yml", ".toml", ".json", ".xml",
    ".html", ".css", ".scss", ".less", ".sh", ".bash", ".zsh", ".sql", ".graphql", ".dockerfile", ".env.example",
];

const DEFAULT_EXCLUDES: &[&str] = &[
    "vendor/", "node_modules/", ".git/", "dist/", "build/", "__pycache__/", ".venv/", "venv/", ".tox/", "target/",
    ".gradle/", ".mvn/", ".idea/", ".vscode/", ".vs/",
];

const BINARY_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".so", ".dylib", ".a", ".o", ".png", ".jpg", ".jpeg", ".gif", ".ico", ".svg", ".webp", ".pdf",
    ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".tar", ".gz", ".rar", ".7z", ".bz2", ".woff",
    ".woff2", ".ttf", ".eot", ".otf", ".mp3", ".mp4", ".wav", ".avi", ".mov", ".mkv", ".webm", ".pyc", ".pyo",
    ".class", ".lock", ".bin", ".dat", ".db", ".sqlite", ".sqlite3",
];

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LocalDirConfig {
    #[serde(alias = "path")]
    dir_path: Option<String>,
    extensions: Option<Vec<String>>,
    #[serde(alias = "exclude")]
    exclude_paths: Option<Vec<String>>,
    max_files: Option<usize>,
    max_file_size: Option<u64>,
    batch_size: Option<usize>,
}

/// Filters applied during the directory walk.
#[derive(Debug, Clone)]
struct ScanFilter {
    extensions: Vec<String>,
    excludes: Vec<String>,
    max_file_size: u64,
}

impl ScanFilter {
    fn from_config(config: &LocalDirConfig) -> Self {
        let normalize_ext = |e: &String| {
            let e = e.trim().to_lowercase();
            if e.starts_with('.') {
                e
            } else {
                format!(".{e}")
            }
        };
        Self {
            extensions: match &config.extensions {
                Some(list) => list.iter().filter(|e| !e.trim().is_empty()).map(normalize_ext).collect(),
                None => DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            },
            excludes: match &config.exclude_paths {
                Some(list) => list
                    .iter()
                    .map(|e| e.trim().trim_end_matches('/').to_string())
                    .filter(|e| !e.is_empty())
                    .collect(),
                None => DEFAULT_EXCLUDES.iter().map(|e| e.trim_end_matches('/').to_string()).collect(),
            },
            max_file_size: config.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
        }
    }

    /// Excluded directories are pruned at any depth.
    fn excludes_dir(&self, rel_dir: &str) -> bool {
        let rel = format!("/{rel_dir}/");
        self.excludes.iter().any(|e| rel.contains(&format!("/{e}/")))
    }

    /// Directory patterns are handled by pruning, so files only match by name.
    fn excludes_file(&self, rel_path: &str) -> bool {
        self.excludes
            .iter()
            .any(|e| rel_path == e || rel_path.ends_with(&format!("/{e}")))
    }

    fn matches_extension(&self, file_name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let name = file_name.to_lowercase();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Walk counters, reported to the step job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub scanned: usize,
    pub excluded_by_path: usize,
    pub excluded_by_extension: usize,
    pub excluded_by_size: usize,
    pub excluded_by_binary: usize,
    /// Nested directories that could not be listed
    pub unreadable_dirs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScannedFile {
    rel_path: String,
    abs_path: PathBuf,
    folder: String,
    extension: String,
    size: u64,
    file_type: String,
}

impl ScannedFile {
    fn into_work_item(self) -> WorkItem {
        let name = self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path).to_string();
        WorkItem::new(self.rel_path.clone(), name, self.file_type.clone()).with_config(json!({
            "path": self.rel_path,
            "absolute_path": self.abs_path.to_string_lossy(),
            "folder": self.folder,
            "extension": self.extension,
            "file_size": self.size,
            "file_type": self.file_type,
        }))
    }
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn is_binary(extension: &str) -> bool {
    BINARY_EXTENSIONS.contains(&extension)
}

/// Classify a file as `code:<lang>`, `config:<kind>`, `markup:<kind>`, or `text`.
fn detect_file_type(file_name: &str, extension: &str) -> String {
    let code = match extension {
        ".go" => Some("go"),
        ".ts" => Some("typescript"),
        ".tsx" => Some("typescript-react"),
        ".js" => Some("javascript"),
        ".jsx" => Some("javascript-react"),
        ".py" => Some("python"),
        ".rs" => Some("rust"),
        ".java" => Some("java"),
        ".kt" => Some("kotlin"),
        ".scala" => Some("scala"),
        ".c" => Some("c"),
        ".cpp" => Some("cpp"),
        ".h" => Some("c-header"),
        ".hpp" => Some("cpp-header"),
        ".rb" => Some("ruby"),
        ".php" => Some("php"),
        ".swift" => Some("swift"),
        ".cs" => Some("csharp"),
        ".sh" => Some("shell"),
        ".bash" => Some("bash"),
        ".zsh" => Some("zsh"),
        ".sql" => Some("sql"),
        ".graphql" => Some("graphql"),
        _ => None,
    };
    if let Some(lang) = code {
        return format!("code:{lang}");
    }

    let config = match extension {
        ".yaml" | ".yml" => Some("yaml"),
        ".toml" => Some("toml"),
        ".json" => Some("json"),
        ".xml" => Some("xml"),
        ".ini" => Some("ini"),
        ".cfg" | ".conf" => Some("config"),
        ".env" => Some("env"),
        ".dockerfile" => Some("dockerfile"),
        _ => None,
    };
    if let Some(kind) = config {
        return format!("config:{kind}");
    }

    let markup = match extension {
        ".md" => Some("markdown"),
        ".mdx" => Some("mdx"),
        ".rst" => Some("restructuredtext"),
        ".html" | ".htm" => Some("html"),
        ".css" => Some("css"),
        ".scss" => Some("scss"),
        ".less" => Some("less"),
        _ => None,
    };
    if let Some(kind) = markup {
        return format!("markup:{kind}");
    }

    match file_name.to_lowercase().as_str() {
        "dockerfile" => "config:dockerfile".into(),
        "makefile" => "build:makefile".into(),
        ".gitignore" | ".dockerignore" | ".npmignore" => "config:ignore".into(),
        _ => "text".into(),
    }
}

fn scan_dir(base: &Path, filter: &ScanFilter) -> Result<(Vec<ScannedFile>, ScanStats)> {
    let mut files = Vec::new();
    let mut stats = ScanStats::default();
    let mut pending = vec![(base.to_path_buf(), String::new())];

    while let Some((dir, rel_dir)) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Only the base directory is required to be readable
            Err(e) if rel_dir.is_empty() => return Err(e.into()),
            Err(e) => {
                warn!(dir = %rel_dir, error = %e, "skipping unreadable directory");
                stats.unreadable_dirs += 1;
                continue;
            }
        };
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Ok(file_type) = entry.file_type() else { continue };
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel_path = if rel_dir.is_empty() {
                name.clone()
            } else {
                format!("{rel_dir}/{name}")
            };

            if file_type.is_dir() {
                if name == ".git" {
                    continue;
                }
                if filter.excludes_dir(&rel_path) {
                    stats.excluded_by_path += 1;
                    continue;
                }
                pending.push((entry.path(), rel_path));
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            stats.scanned += 1;
            if filter.excludes_file(&rel_path) {
                stats.excluded_by_path += 1;
                continue;
            }
            if !filter.matches_extension(&name) {
                stats.excluded_by_extension += 1;
                continue;
            }
            let extension = extension_of(&name);
            if is_binary(&extension) {
                stats.excluded_by_binary += 1;
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            if metadata.len() > filter.max_file_size {
                stats.excluded_by_size += 1;
                continue;
            }

            files.push(ScannedFile {
                file_type: detect_file_type(&name, &extension),
                folder: if rel_dir.is_empty() { ".".to_string() } else { rel_dir.clone() },
                abs_path: entry.path(),
                rel_path,
                extension,
                size: metadata.len(),
            });
        }
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok((files, stats))
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone)]
pub struct LocalDirPlan {
    pub base_path: PathBuf,
    pub label: String,
    pub batch_size: usize,
    pub stats: ScanStats,
    /// Files matched before the `max_files` cut
    pub matched: usize,
}

pub struct LocalDirWorker {
    jobs: Arc<JobManager>,
    batch_size: usize,
}

impl LocalDirWorker {
    pub fn new(jobs: Arc<JobManager>, config: &EngineConfig) -> Self {
        Self {
            jobs,
            batch_size: config.batch_size,
        }
    }
}

#[async_trait]
impl Worker for LocalDirWorker {
    type Plan = LocalDirPlan;

    fn worker_type(&self) -> &'static str {
        WORKER_TYPE
    }

    fn validate_config(&self, step: &JobStep) -> Result<()> {
        let config: LocalDirConfig = step.parse_config()?;
        if config.dir_path.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(EngineError::invalid_config(
                WORKER_TYPE,
                format!("step '{}' requires 'dir_path'", step.name),
            ));
        }
        if config.batch_size == Some(0) {
            return Err(EngineError::invalid_config(WORKER_TYPE, "batch_size must be greater than 0"));
        }
        Ok(())
    }

    async fn init(
        &self,
        _cancel: &CancellationToken,
        step: &JobStep,
        _definition: &JobDefinition,
    ) -> Result<InitResult<LocalDirPlan>> {
        self.validate_config(step)?;
        let config: LocalDirConfig = step.parse_config()?;

        let base_path = PathBuf::from(config.dir_path.as_deref().unwrap_or_default().trim());
        if !base_path.is_dir() {
            return Err(EngineError::invalid_config(
                WORKER_TYPE,
                format!("directory does not exist: {}", base_path.display()),
            ));
        }

        let filter = ScanFilter::from_config(&config);
        let walk_base = base_path.clone();
        let (mut files, stats) = tokio::task::spawn_blocking(move || scan_dir(&walk_base, &filter))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

        let matched = files.len();
        files.truncate(config.max_files.unwrap_or(DEFAULT_MAX_FILES));

        info!(
            phase = "init",
            step = %step.name,
            base_path = %base_path.display(),
            scanned = stats.scanned,
            matched,
            kept = files.len(),
            "local directory scanned"
        );

        let label = base_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| base_path.display().to_string());

        let items = files.into_iter().map(ScannedFile::into_work_item).collect();
        Ok(InitResult::parallel(
            items,
            SUGGESTED_CONCURRENCY,
            LocalDirPlan {
                base_path,
                label,
                batch_size: config.batch_size.unwrap_or(self.batch_size),
                stats,
                matched,
            },
        ))
    }

    async fn create_jobs(
        &self,
        cancel: &CancellationToken,
        step: &JobStep,
        definition: &JobDefinition,
        step_job_id: Uuid,
        init: Option<InitResult<LocalDirPlan>>,
    ) -> Result<Uuid> {
        let init = match init {
            Some(init) => init,
            None => self.init(cancel, step, definition).await?,
        };
        let plan = &init.plan;
        let stats = plan.stats;

        self.jobs
            .phase_log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!("Scanning '{}'", plan.base_path.display()),
                PHASE_RUN,
            )
            .await;
        self.jobs
            .phase_log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!(
                    "Scanned {} files: {} excluded by path, {} by extension, {} by size, {} by binary, {} unreadable directories",
                    stats.scanned,
                    stats.excluded_by_path,
                    stats.excluded_by_extension,
                    stats.excluded_by_size,
                    stats.excluded_by_binary,
                    stats.unreadable_dirs
                ),
                PHASE_RUN,
            )
            .await;

        if init.total_count < plan.matched {
            self.jobs
                .phase_log_or_warn(
                    step_job_id,
                    LogLevel::Warn,
                    &format!("File limit reached: indexing {} of {} matched files", init.total_count, plan.matched),
                    PHASE_RUN,
                )
                .await;
        }

        let batch_count = init.total_count.div_ceil(plan.batch_size.max(1));
        self.jobs
            .phase_log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!(
                    "Matched {} files, creating {} batch jobs ({} files per batch)",
                    init.total_count, batch_count, plan.batch_size
                ),
                PHASE_RUN,
            )
            .await;

        let mut extra = ConfigMap::new();
        extra.insert("base_path".into(), json!(plan.base_path.to_string_lossy()));
        extra.insert("tags".into(), json!(definition.tags));
        extra.insert("job_definition_id".into(), json!(definition.id));
        extra.insert("step_name".into(), json!(step.name));

        let dispatch = BatchDispatch {
            parent_id: step_job_id,
            job_type: BATCH_JOB_TYPE.to_string(),
            label: plan.label.clone(),
            batch_size: plan.batch_size,
            extra,
        };
        let report = dispatch_batches(cancel, &self.jobs, &dispatch, &init.work_items).await?;

        for (batch_idx, error) in &report.failed {
            self.jobs
                .phase_log_or_warn(
                    step_job_id,
                    LogLevel::Warn,
                    &format!("Failed to create batch {}: {error}", batch_idx + 1),
                    PHASE_RUN,
                )
                .await;
        }
        self.jobs
            .phase_log_or_warn(
                step_job_id,
                LogLevel::Info,
                &format!("Created {} batch jobs for {} files", report.dispatched(), init.total_count),
                PHASE_RUN,
            )
            .await;

        Ok(step_job_id)
    }

    fn returns_child_jobs(&self) -> bool {
        true
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }
}

// ============================================================================
// Batch executor
// ============================================================================

#[derive(Debug, Deserialize)]
struct BatchPayload {
    base_path: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    items: Vec<WorkItem>,
}

#[derive(Debug, Deserialize)]
struct FileItem {
    path: String,
    absolute_path: String,
    #[serde(default)]
    folder: String,
    #[serde(default)]
    extension: String,
    #[serde(default)]
    file_size: u64,
    #[serde(default)]
    file_type: String,
}

/// Executes `local_dir_batch` jobs.
pub struct LocalDirBatchExecutor {
    jobs: Arc<JobManager>,
    documents: Arc<dyn DocumentStore>,
}

impl LocalDirBatchExecutor {
    pub fn new(jobs: Arc<JobManager>, documents: Arc<dyn DocumentStore>) -> Self {
        Self { jobs, documents }
    }

    async fn index_file(&self, payload: &BatchPayload, item: &WorkItem) -> Result<Document> {
        let file: FileItem = serde_json::from_value(item.config.clone())?;
        let content = tokio::fs::read_to_string(&file.absolute_path).await?;

        let mut tags = payload.tags.clone();
        tags.push(SOURCE_TYPE.to_string());

        let metadata = json!({
            "base_path": payload.base_path,
            "file_path": file.path,
            "folder": file.folder,
            "extension": file.extension,
            "file_size": file.file_size,
            "file_type": file.file_type,
            "type": "local_file",
        });
        let doc = Document::builder()
            .source_type(SOURCE_TYPE)
            .source_id(file.path.clone())
            .title(item.name.clone())
            .content_markdown(content)
            .metadata(metadata.as_object().cloned().unwrap_or_default())
            .url(format!("file://{}", file.absolute_path))
            .tags(tags)
            .last_synced(chrono::Utc::now())
            .build();

        self.documents.save_document(&doc).await
    }
}

#[async_trait]
impl JobExecutor for LocalDirBatchExecutor {
    fn job_type(&self) -> &'static str {
        BATCH_JOB_TYPE
    }

    async fn execute(&self, cancel: &CancellationToken, job: &QueueJob) -> Result<()> {
        let payload: BatchPayload = serde_json::from_value(job.config.clone())
            .map_err(|e| EngineError::invalid_config(BATCH_JOB_TYPE, e.to_string()))?;
        let total = payload.items.len() as i64;

        let mut saved = 0usize;
        let mut errors: HashMap<String, String> = HashMap::new();

        for (idx, item) in payload.items.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.index_file(&payload, item).await {
                Ok(doc) => {
                    debug!(job_id = %job.id, source_id = %doc.source_id, "file indexed");
                    saved += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, path = %item.id, error = %e, "failed to index file");
                    errors.insert(item.id.clone(), e.to_string());
                }
            }
            if let Err(e) = self.jobs.update_job_progress(job.id, idx as i64 + 1, total).await {
                warn!(job_id = %job.id, error = %e, "failed to update progress");
            }
        }

        self.jobs
            .phase_log_or_warn(
                job.id,
                LogLevel::Info,
                &format!("Batch complete: {saved} saved, {} errors", errors.len()),
                PHASE_RUN,
            )
            .await;

        if total > 0 && saved == 0 {
            let sample = errors.values().next().cloned().unwrap_or_default();
            return Err(EngineError::persistence(format!(
                "no files saved in batch ({} errors, e.g. {sample})",
                errors.len()
            )));
        }
        Ok(())
    }
}
