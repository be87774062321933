//! Core domain model for the AMI watcher: image records, repository targets and matching.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "amibot-core";

/// One published machine image, as listed by the releases table.
///
/// `ami_id` is the natural key; the other fields are only used for matching and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub zone: String,
    pub version: String,
    pub instance_type: String,
    pub cpu_arch: String,
    pub date: String,
    pub ami_id: String,
}

/// Criteria a record must satisfy for a repository to care about it.
///
/// `cpu_arch` is optional: when unset, any architecture matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub zone: String,
    pub version: String,
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_arch: Option<String>,
}

impl Criteria {
    pub fn matches(&self, record: &ImageRecord) -> bool {
        self.zone == record.zone
            && self.version == record.version
            && self.instance_type == record.instance_type
            && self
                .cpu_arch
                .as_deref()
                .map_or(true, |arch| arch == record.cpu_arch)
    }
}

/// A downstream repository plus the criteria under which it gets a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    pub repo: String,
    pub criteria: Criteria,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing target config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("target config lists no repositories")]
    Empty,
}

/// On-disk target configuration. Both historical shapes are accepted and
/// normalized into the same `Vec<RepoTarget>` by [`TargetConfig::into_targets`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "TargetFile")]
pub enum TargetConfig {
    /// `repos: { org/name: { zone, version, instance_type, cpu_arch? } }`
    PerRepo { repos: IndexMap<String, Criteria> },
    /// One shared version/instance-type filter, with repositories grouped by zone.
    PerZone {
        version: String,
        instance_type: String,
        cpu_arch: Option<String>,
        zones: IndexMap<String, Vec<String>>,
    },
}

/// Field-level view of the file. Read directly rather than through an untagged
/// enum so that scalars such as `version: 18.10` keep their literal text.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetFile {
    #[serde(default)]
    repos: Option<IndexMap<String, Criteria>>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    instance_type: Option<String>,
    #[serde(default)]
    cpu_arch: Option<String>,
    #[serde(default)]
    zones: Option<IndexMap<String, Vec<String>>>,
}

impl TryFrom<TargetFile> for TargetConfig {
    type Error = String;

    fn try_from(file: TargetFile) -> Result<Self, String> {
        match file {
            TargetFile {
                repos: Some(repos),
                version: None,
                instance_type: None,
                cpu_arch: None,
                zones: None,
            } => Ok(TargetConfig::PerRepo { repos }),
            TargetFile {
                repos: None,
                version: Some(version),
                instance_type: Some(instance_type),
                cpu_arch,
                zones: Some(zones),
            } => Ok(TargetConfig::PerZone {
                version,
                instance_type,
                cpu_arch,
                zones,
            }),
            _ => Err(
                "expected either `repos`, or `zones` with `version` and `instance_type`".into(),
            ),
        }
    }
}

impl TargetConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn into_targets(self) -> Result<Vec<RepoTarget>, ConfigError> {
        let targets: Vec<RepoTarget> = match self {
            TargetConfig::PerRepo { repos } => repos
                .into_iter()
                .map(|(repo, criteria)| RepoTarget { repo, criteria })
                .collect(),
            TargetConfig::PerZone {
                version,
                instance_type,
                cpu_arch,
                zones,
            } => zones
                .into_iter()
                .flat_map(|(zone, repos)| {
                    let criteria = Criteria {
                        zone,
                        version: version.clone(),
                        instance_type: instance_type.clone(),
                        cpu_arch: cpu_arch.clone(),
                    };
                    repos.into_iter().map(move |repo| RepoTarget {
                        repo,
                        criteria: criteria.clone(),
                    })
                })
                .collect(),
        };
        if targets.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(targets)
    }
}

/// Targets interested in `record`, in configuration order. A repository that is
/// listed more than once is returned only once.
pub fn matching_targets<'a>(
    record: &ImageRecord,
    targets: &'a [RepoTarget],
) -> Vec<&'a RepoTarget> {
    let mut out: Vec<&RepoTarget> = Vec::new();
    for target in targets {
        if target.criteria.matches(record) && !out.iter().any(|t| t.repo == target.repo) {
            out.push(target);
        }
    }
    out
}

pub fn release_message(record: &ImageRecord) -> String {
    format!(
        "Found new Ubuntu {} ({}) image in {}: `{}`",
        record.version, record.instance_type, record.zone, record.ami_id
    )
}

pub fn commit_message(ami_id: &str) -> String {
    format!("Update ubuntu_ami_id to {ami_id}")
}
