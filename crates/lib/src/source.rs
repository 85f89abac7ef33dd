//! Where root filesystem content comes from.
//!
//! The string form (`oci://`, `dir://`, `file://`, or empty) is what we
//! persist in the install state ledger and compare for change detection.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

const OCI_SCHEME: &str = "oci";
const DOCKER_SCHEME: &str = "docker";
const DIR_SCHEME: &str = "dir";
const FILE_SCHEME: &str = "file";

/// The content of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// A container image reference, e.g. `registry.example.com/os:v1`
    Oci(String),
    /// A local directory tree
    Dir(Utf8PathBuf),
    /// A local filesystem image file
    File(Utf8PathBuf),
    /// Nothing; deploying it leaves the target untouched
    Empty,
}

/// A source plus the content digest recorded after deploying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageSource {
    kind: SourceKind,
    digest: Option<String>,
}

impl ImageSource {
    pub(crate) fn oci(imgref: impl Into<String>) -> Self {
        SourceKind::Oci(imgref.into()).into()
    }

    pub(crate) fn dir(path: impl Into<Utf8PathBuf>) -> Self {
        SourceKind::Dir(path.into()).into()
    }

    pub(crate) fn file(path: impl Into<Utf8PathBuf>) -> Self {
        SourceKind::File(path.into()).into()
    }

    pub(crate) fn empty() -> Self {
        SourceKind::Empty.into()
    }

    pub(crate) fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.kind == SourceKind::Empty
    }

    pub(crate) fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Attach the digest computed while deploying.
    pub(crate) fn with_digest(mut self, digest: Option<String>) -> Self {
        self.digest = digest.filter(|d| !d.is_empty());
        self
    }

    /// The local path backing this source, if it has one.
    pub(crate) fn local_path(&self) -> Option<&Utf8Path> {
        match &self.kind {
            SourceKind::Dir(p) | SourceKind::File(p) => Some(p),
            SourceKind::Oci(_) | SourceKind::Empty => None,
        }
    }
}

impl From<SourceKind> for ImageSource {
    fn from(kind: SourceKind) -> Self {
        Self { kind, digest: None }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SourceKind::Oci(r) => write!(f, "{OCI_SCHEME}://{r}"),
            SourceKind::Dir(p) => write!(f, "{DIR_SCHEME}://{p}"),
            SourceKind::File(p) => write!(f, "{FILE_SCHEME}://{p}"),
            SourceKind::Empty => Ok(()),
        }
    }
}

impl FromStr for ImageSource {
    type Err = anyhow::Error;

    /// Parse a source URI. A value without a scheme is taken as a
    /// container image reference.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let Some((scheme, value)) = s.split_once("://") else {
            return Ok(Self::oci(s));
        };
        if value.is_empty() {
            anyhow::bail!("Invalid source {s}: empty value");
        }
        match scheme {
            OCI_SCHEME | DOCKER_SCHEME => Ok(Self::oci(value)),
            DIR_SCHEME => Ok(Self::dir(value)),
            FILE_SCHEME => Ok(Self::file(value)),
            o => anyhow::bail!("Invalid source {s}: unknown scheme {o}"),
        }
    }
}

impl TryFrom<String> for ImageSource {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ImageSource> for String {
    fn from(value: ImageSource) -> Self {
        value.to_string()
    }
}
