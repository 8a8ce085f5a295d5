use std::cmp::Ordering;
use std::fmt;

use anyhow::{anyhow, bail};

use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Comparison {
    #[default]
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_uppercase().as_str() {
            "=" | "==" | "EQ" => Some(Self::Eq),
            "<" | "LT" => Some(Self::Lt),
            "<=" | "LE" => Some(Self::Le),
            ">" | "GT" => Some(Self::Gt),
            ">=" | "GE" => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "",
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Any => true,
            Self::Eq => ordering == Ordering::Equal,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
        }
    }
}

/// A named dependency with an optional version constraint.
///
/// The release part is only compared when the requirement names one, so
/// `libfoo >= 2.0` is met by every `2.0-N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    pub name: String,
    pub comparison: Comparison,
    pub version: Option<Version>,
    pub release: Option<Version>,
}

impl Requirement {
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comparison: Comparison::Any,
            version: None,
            release: None,
        }
    }

    pub fn exact(name: impl Into<String>, version: Version, release: Option<Version>) -> Self {
        Self {
            name: name.into(),
            comparison: Comparison::Eq,
            version: Some(version),
            release,
        }
    }

    /// Parses `name`, `name OP version` or `name OP version-release`.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            bail!("requirement must not be empty");
        }

        let operator_start = trimmed.find(['<', '>', '=']);
        let (name, constraint) = match operator_start {
            Some(index) => (trimmed[..index].trim(), Some(trimmed[index..].trim())),
            None => {
                let mut parts = trimmed.split_whitespace();
                let name = parts.next().unwrap_or_default();
                match (parts.next(), parts.next()) {
                    (None, _) => (name, None),
                    (Some(_), Some(_)) => {
                        let rest = trimmed[name.len()..].trim();
                        (name, Some(rest))
                    }
                    (Some(_), None) => {
                        bail!("requirement '{trimmed}' has a version but no operator")
                    }
                }
            }
        };

        if name.is_empty() || name.contains(char::is_whitespace) {
            bail!("invalid requirement name in '{trimmed}'");
        }

        let Some(constraint) = constraint else {
            return Ok(Self::any(name));
        };

        let split_at = constraint
            .find(|ch: char| !matches!(ch, '<' | '>' | '='))
            .unwrap_or(constraint.len());
        let (operator, evr) = constraint.split_at(split_at);
        let (operator, evr) = if operator.is_empty() {
            let mut words = constraint.splitn(2, char::is_whitespace);
            let word = words.next().unwrap_or_default();
            (word, words.next().unwrap_or_default())
        } else {
            (operator, evr)
        };

        let comparison = Comparison::parse(operator)
            .ok_or_else(|| anyhow!("unknown comparison '{operator}' in '{trimmed}'"))?;
        let evr = evr.trim();
        if evr.is_empty() {
            // `name =` with nothing after it means any version
            return Ok(Self::any(name));
        }

        let (version, release) = split_evr(evr);
        Ok(Self {
            name: name.to_string(),
            comparison,
            version: Some(version),
            release,
        })
    }

    pub fn is_versioned(&self) -> bool {
        self.comparison != Comparison::Any
            && self.version.as_ref().is_some_and(|version| !version.is_empty())
    }

    /// True when `version`/`release` fall inside this requirement's range.
    pub fn matches_version(&self, version: &Version, release: &Version) -> bool {
        if !self.is_versioned() {
            return true;
        }
        let Some(wanted_version) = &self.version else {
            return true;
        };

        let mut ordering = version.cmp(wanted_version);
        if ordering == Ordering::Equal {
            if let Some(wanted_release) = &self.release {
                ordering = release.cmp(wanted_release);
            }
        }
        self.comparison.accepts(ordering)
    }

    /// Checks a `provides` entry against this requirement.
    ///
    /// An unversioned capability only satisfies an unversioned requirement.
    pub fn matches_capability(&self, capability: &Capability) -> bool {
        if capability.name != self.name {
            return false;
        }
        if !self.is_versioned() {
            return true;
        }
        match &capability.version {
            Some(version) => {
                let release = capability.release.clone().unwrap_or_else(Version::empty);
                self.matches_version(version, &release)
            }
            None => false,
        }
    }
}

fn split_evr(evr: &str) -> (Version, Option<Version>) {
    match evr.split_once('-') {
        Some((version, release)) if !release.trim().is_empty() => {
            (Version::parse(version), Some(Version::parse(release)))
        }
        Some((version, _)) => (Version::parse(version), None),
        None => (Version::parse(evr), None),
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let (true, Some(version)) = (self.is_versioned(), &self.version) {
            write!(f, " {} {}", self.comparison.as_str(), version)?;
            if let Some(release) = &self.release {
                write!(f, "-{release}")?;
            }
        }
        Ok(())
    }
}

/// A name a package declares it provides, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    pub name: String,
    pub version: Option<Version>,
    pub release: Option<Version>,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            release: None,
        }
    }

    /// Parses `name` or `name = version[-release]`.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let requirement = Requirement::parse(input)?;
        match requirement.comparison {
            Comparison::Any | Comparison::Eq => Ok(Self {
                name: requirement.name,
                version: requirement.version,
                release: requirement.release,
            }),
            other => bail!(
                "provides entry '{}' must use '=' (found '{}')",
                input.trim(),
                other.as_str()
            ),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(version) = &self.version {
            write!(f, " = {version}")?;
            if let Some(release) = &self.release {
                write!(f, "-{release}")?;
            }
        }
        Ok(())
    }
}
