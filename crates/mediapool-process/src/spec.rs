//! Job descriptors: command vector, launch options, and redirection targets.

use mediapool_common::{JobError, JobId, JobResult, Weight};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

/// Where a job's stdout or stderr goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTarget {
    /// Inherit the parent's stream.
    #[default]
    Inherit,
    /// Discard the output.
    Null,
    /// Create (or truncate) a file at the given path; parent directories
    /// are created as needed.
    File(PathBuf),
}

impl OutputTarget {
    /// Resolves the target into a [`Stdio`], creating file targets (and
    /// their parent directories) on the way.
    pub fn open(&self, id: JobId) -> JobResult<Stdio> {
        match self {
            OutputTarget::Inherit => Ok(Stdio::inherit()),
            OutputTarget::Null => Ok(Stdio::null()),
            OutputTarget::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            JobError::redirect_failed(id, format!("{}: {}", parent.display(), e))
                        })?;
                    }
                }
                let file = std::fs::File::create(path).map_err(|e| {
                    JobError::redirect_failed(id, format!("{}: {}", path.display(), e))
                })?;
                Ok(Stdio::from(file))
            }
        }
    }
}

/// Description of one external command invocation.
///
/// Collaborators build these (transcoder argument lists, multiplexer calls,
/// OCR passes) and hand them to the scheduler; the descriptor maps directly
/// onto the YAML job-file format accepted by the `mediapool` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory override.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Environment variable overrides, applied on top of the inherited
    /// environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Concurrency slots the job occupies while running.
    #[serde(default)]
    pub weight: Weight,

    /// Per-slot CPU percentage cap, 0 or absent for unlimited. Best-effort:
    /// applied only when a limiter tool is available on the host.
    #[serde(default)]
    pub cpu_limit: Option<u32>,

    /// Redirection target for stdout.
    #[serde(default)]
    pub stdout: OutputTarget,

    /// Redirection target for stderr.
    #[serde(default)]
    pub stderr: OutputTarget,
}

impl JobSpec {
    /// Creates a descriptor for `program` with the given arguments and
    /// defaults for everything else (weight 1, inherited output, no cap).
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: HashMap::new(),
            weight: Weight::default(),
            cpu_limit: None,
            stdout: OutputTarget::Inherit,
            stderr: OutputTarget::Inherit,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Weight::new(weight);
        self
    }

    pub fn with_cpu_limit(mut self, percent: u32) -> Self {
        self.cpu_limit = Some(percent);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdout(mut self, target: OutputTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn with_stderr(mut self, target: OutputTarget) -> Self {
        self.stderr = target;
        self
    }

    /// One-line rendering of the command for log output.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}
