use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_OUTPUT: &str = "packs";
pub const DEFAULT_PACKAGE_SIZE_KB: usize = 200;
pub const DEFAULT_MAX_DOWNLOAD_KB: usize = 5000;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// Output location: a directory, or `s3://bucket/prefix`
    #[serde(default = "default_output")]
    pub output: String,
    /// Number of concurrent downloads
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Target compressed chunk size in KB
    #[serde(default = "default_package_size_kb")]
    pub package_size_kb: usize,
    /// Largest accepted feed document in KB
    #[serde(default = "default_max_download_kb")]
    pub max_download_kb: usize,
    /// Take the catalogue lock even if it is held
    #[serde(default)]
    pub force: bool,
}

fn default_output() -> String {
    DEFAULT_OUTPUT.to_string()
}

fn default_jobs() -> usize {
    num_cpus::get()
}

fn default_package_size_kb() -> usize {
    DEFAULT_PACKAGE_SIZE_KB
}

fn default_max_download_kb() -> usize {
    DEFAULT_MAX_DOWNLOAD_KB
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: default_output(),
            jobs: default_jobs(),
            package_size_kb: default_package_size_kb(),
            max_download_kb: default_max_download_kb(),
            force: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `FEEDPACK_*` environment overrides.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(output) = lookup("FEEDPACK_OUTPUT_PATH") {
            self.output = output;
        }
        if let Some(jobs) = lookup("FEEDPACK_JOBS") {
            self.jobs = jobs.parse()?;
        }
        if let Some(size) = lookup("FEEDPACK_PACKAGE_SIZE") {
            self.package_size_kb = size.parse()?;
        }
        if let Some(size) = lookup("FEEDPACK_MAX_DOWNLOAD") {
            self.max_download_kb = size.parse()?;
        }
        if let Some(force) = lookup("FEEDPACK_FORCE") {
            self.force = matches!(force.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.output.trim().is_empty(), "output location is empty");
        anyhow::ensure!(self.jobs > 0, "jobs must be greater than 0");
        anyhow::ensure!(self.package_size_kb > 0, "package size must be greater than 0");
        anyhow::ensure!(self.max_download_kb > 0, "max download must be greater than 0");
        Ok(())
    }
}
