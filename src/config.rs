use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "texd", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file, or fall back to defaults
    pub fn to_config(&self) -> Result<Config> {
        match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("failed to open config file {path}"))?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader).context("failed to parse config file")
            }
            None => Ok(Config::default()),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub retention: RetentionConfig,
    pub paths: PathsConfig,
    pub sandbox: SandboxConfig,
    pub engines: EngineSet,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    /// Simultaneous project builds
    pub max_concurrent_builds: u8,
    /// Simultaneous one-shot compiles; capped independently of project builds
    pub max_concurrent_oneshot: u8,
    /// Wall-clock budget for one compile, in seconds
    pub compile_timeout_secs: u64,
    /// Hard memory ceiling per compile, in megabytes
    pub memory_limit_mb: u32,
    /// CPU budget per compile as a fraction of one core
    pub cpu_fraction: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 2,
            max_concurrent_oneshot: 2,
            compile_timeout_secs: 180,
            memory_limit_mb: 1024,
            cpu_fraction: 1.0,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age after which a non-terminal record is attributed to a dead process
    pub stale_build_secs: u64,
    /// Lifetime of a finished one-shot job's directory
    pub oneshot_ttl_secs: u64,
    /// How often the one-shot expiry sweep runs
    pub sweep_interval_secs: u64,
    /// Heartbeat publish interval; the record's TTL is three times this
    pub heartbeat_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            stale_build_secs: 3600,
            oneshot_ttl_secs: 3600,
            sweep_interval_secs: 300,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for projects, working directories, artifacts and one-shot jobs.
    /// Defaults to the platform data directory.
    pub data_root: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Image used by the container backend
    pub image: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "texlive/texlive:latest".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct EngineConfig {
    pub name: String,
    /// Command template; %MAIN% is replaced with the entry file name
    pub command: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(transparent)]
pub struct EngineSet(pub Vec<EngineConfig>);

impl EngineSet {
    pub fn find(&self, name: &str) -> Option<&EngineConfig> {
        self.0.iter().find(|e| e.name == name)
    }

    pub fn knows(&self, name: &str) -> bool {
        name == "auto" || self.find(name).is_some()
    }
}

impl Default for EngineSet {
    fn default() -> Self {
        let latexmk = |engine_flag: &str| -> Vec<String> {
            [
                "latexmk",
                engine_flag,
                "-interaction=nonstopmode",
                "-halt-on-error",
                "-file-line-error",
                "%MAIN%",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()
        };

        Self(vec![
            EngineConfig {
                name: "pdflatex".to_string(),
                command: latexmk("-pdf"),
            },
            EngineConfig {
                name: "xelatex".to_string(),
                command: latexmk("-pdfxe"),
            },
            EngineConfig {
                name: "lualatex".to_string(),
                command: latexmk("-pdflua"),
            },
        ])
    }
}

/// Resolved directory layout under the data root
#[derive(Debug, Clone)]
pub struct DataDirs {
    /// Project file trees, written by the editor, read-only for us
    pub projects_root: PathBuf,
    /// Job-unique working directories, removed at job end
    pub work_root: PathBuf,
    /// Compiled artifacts of project builds
    pub artifacts_root: PathBuf,
    /// One-shot job directories (source, artifact, logs, metadata)
    pub oneshot_root: PathBuf,
}

impl DataDirs {
    pub fn resolve(paths: &PathsConfig) -> Result<Self> {
        let root = match &paths.data_root {
            Some(root) => root.clone(),
            None => {
                use directories::ProjectDirs;
                let proj_dirs = ProjectDirs::from("", "", "texd")
                    .ok_or_else(|| anyhow::anyhow!("unable to find user directory"))?;
                proj_dirs.data_local_dir().to_path_buf()
            }
        };

        let dirs = Self {
            projects_root: root.join("projects"),
            work_root: root.join("work"),
            artifacts_root: root.join("artifacts"),
            oneshot_root: root.join("oneshot"),
        };
        for dir in [
            &dirs.projects_root,
            &dirs.work_root,
            &dirs.artifacts_root,
            &dirs.oneshot_root,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_knob() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.limits.max_concurrent_builds, 2);
        assert_eq!(config.limits.compile_timeout_secs, 180);
        assert_eq!(config.retention.heartbeat_interval_secs, 30);
        assert!(config.engines.knows("pdflatex"));
        assert!(config.engines.knows("auto"));
        assert!(!config.engines.knows("troff"));
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config: Config = serde_json::from_str(
            r#"{"limits": {"max_concurrent_builds": 8}, "sandbox": {"image": "texlive:2024"}}"#,
        )
        .unwrap();
        assert_eq!(config.limits.max_concurrent_builds, 8);
        assert_eq!(config.limits.max_concurrent_oneshot, 2);
        assert_eq!(config.sandbox.image, "texlive:2024");
    }
}
