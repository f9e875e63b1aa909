//! Reading `.nupkg` archives.
//!
//! A package is a zip archive with a single `<id>.nuspec` XML manifest at the
//! root. Everything the feed knows about a package comes from that manifest
//! plus the layout of the archive (`lib/<tfm>/` folders) and any readme, icon
//! or license file the manifest points at.

use std::collections::BTreeSet;
use std::io::{Cursor, Read};

use bytes::Bytes;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::id::{IdError, PackageId};
use crate::version::{PackageVersion, VersionError};

/// Reasons a package archive is rejected.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The bytes are not a readable zip archive.
    #[error("package is not a valid zip archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Reading an archive entry failed.
    #[error("failed to read archive entry {entry}: {source}")]
    Entry {
        /// The entry name.
        entry: String,
        /// The underlying read failure.
        #[source]
        source: std::io::Error,
    },

    /// No `.nuspec` at the archive root.
    #[error("package does not contain a .nuspec manifest")]
    MissingManifest,

    /// More than one `.nuspec` at the archive root.
    #[error("package contains more than one .nuspec manifest")]
    MultipleManifests,

    /// The manifest is not well-formed XML.
    #[error("malformed manifest: {0}")]
    Xml(String),

    /// A required manifest element is absent or empty.
    #[error("manifest is missing required element <{0}>")]
    MissingElement(&'static str),

    /// The manifest id is not a valid package id.
    #[error("invalid package id: {0}")]
    Id(#[from] IdError),

    /// The manifest version could not be parsed.
    #[error("invalid package version: {0}")]
    Version(#[from] VersionError),

    /// The manifest names an embedded file which is not in the archive.
    #[error("manifest references {0}, which is not in the package")]
    MissingEmbeddedFile(String),
}

impl From<quick_xml::Error> for ManifestError {
    fn from(err: quick_xml::Error) -> Self {
        ManifestError::Xml(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ManifestError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        ManifestError::Xml(err.to_string())
    }
}

/// A dependency on another package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The dependency id, as written.
    pub id: String,
    /// The version range, as written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

/// Dependencies which apply to one target framework, or to all of them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DependencyGroup {
    /// The target framework, absent for framework-agnostic dependencies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_framework: Option<String>,
    /// The dependencies in this group.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Metadata from a `.nuspec` manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Package id, as written.
    pub id: String,
    /// Package version, as written.
    pub version: String,
    /// Authors, split on commas.
    pub authors: Vec<String>,
    /// Long description.
    pub description: String,
    /// Short summary.
    pub summary: Option<String>,
    /// Display title.
    pub title: Option<String>,
    /// Tags, split on whitespace.
    pub tags: Vec<String>,
    /// Project homepage.
    pub project_url: Option<String>,
    /// Icon URL (the legacy alternative to an embedded icon).
    pub icon_url: Option<String>,
    /// License URL (the legacy alternative to an embedded license).
    pub license_url: Option<String>,
    /// SPDX license expression.
    pub license_expression: Option<String>,
    /// Release notes.
    pub release_notes: Option<String>,
    /// Source repository URL.
    pub repository_url: Option<String>,
    /// Source repository type (`git`, ...).
    pub repository_type: Option<String>,
    /// Whether clients must prompt for license acceptance.
    pub require_license_acceptance: bool,
    /// Minimum client version able to consume the package.
    pub min_client_version: Option<String>,
    /// Dependency groups in manifest order.
    pub dependency_groups: Vec<DependencyGroup>,
    /// Package types, `Dependency` when none are declared.
    pub package_types: Vec<String>,
    /// Archive path of the embedded readme.
    pub readme: Option<String>,
    /// Archive path of the embedded icon.
    pub icon: Option<String>,
    /// Archive path of the embedded license file.
    pub license_file: Option<String>,
}

/// A parsed package archive, with its embedded files read out.
#[derive(Debug, Clone)]
pub struct PackageArchive {
    /// The validated id.
    pub id: PackageId,
    /// The parsed version.
    pub version: PackageVersion,
    /// Everything else from the manifest.
    pub manifest: Manifest,
    /// The raw manifest bytes.
    pub nuspec: Bytes,
    /// Embedded readme bytes.
    pub readme: Option<Bytes>,
    /// Embedded icon bytes.
    pub icon: Option<Bytes>,
    /// Embedded license bytes.
    pub license: Option<Bytes>,
    /// Target frameworks from dependency groups and `lib/` folders, sorted.
    pub target_frameworks: Vec<String>,
}

fn entry_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.trim_start_matches("./").trim_start_matches('/').to_owned()
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    index: usize,
) -> Result<(String, Bytes), ManifestError> {
    let mut file = archive.by_index(index)?;
    let name = file.name().to_owned();
    let mut data = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
    file.read_to_end(&mut data)
        .map_err(|source| ManifestError::Entry {
            entry: name.clone(),
            source,
        })?;
    Ok((name, data.into()))
}

/// Open a package archive and read its manifest and embedded files.
pub fn read_package(data: &[u8]) -> Result<PackageArchive, ManifestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;

    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        names.push(archive.by_index_raw(index)?.name().to_owned());
    }
    let mut nuspecs = names
        .iter()
        .enumerate()
        .filter(|(_, name)| !name.contains('/') && name.to_ascii_lowercase().ends_with(".nuspec"));
    let (nuspec_index, _) = nuspecs.next().ok_or(ManifestError::MissingManifest)?;
    if nuspecs.next().is_some() {
        return Err(ManifestError::MultipleManifests);
    }

    let (_, nuspec) = read_entry(&mut archive, nuspec_index)?;
    let manifest = parse_nuspec(&nuspec)?;
    let id = PackageId::new(&manifest.id)?;
    let version = PackageVersion::parse(&manifest.version)?;

    let mut embedded = |path: &Option<String>| -> Result<Option<Bytes>, ManifestError> {
        let Some(path) = path else {
            return Ok(None);
        };
        let wanted = entry_path(path);
        let index = names
            .iter()
            .position(|name| *name == wanted)
            .or_else(|| names.iter().position(|name| name.eq_ignore_ascii_case(&wanted)))
            .ok_or_else(|| ManifestError::MissingEmbeddedFile(wanted.clone()))?;
        read_entry(&mut archive, index).map(|(_, data)| Some(data))
    };

    let readme = embedded(&manifest.readme)?;
    let icon = embedded(&manifest.icon)?;
    let license = embedded(&manifest.license_file)?;

    let mut frameworks = BTreeSet::new();
    for group in &manifest.dependency_groups {
        if let Some(tfm) = &group.target_framework {
            frameworks.insert(tfm.to_ascii_lowercase());
        }
    }
    for name in &names {
        let mut parts = name.split('/');
        if let (Some(root), Some(tfm), Some(_)) = (parts.next(), parts.next(), parts.next()) {
            if root.eq_ignore_ascii_case("lib") && !tfm.is_empty() {
                frameworks.insert(tfm.to_ascii_lowercase());
            }
        }
    }

    tracing::trace!(%id, %version, "read package archive");

    Ok(PackageArchive {
        id,
        version,
        manifest,
        nuspec,
        readme,
        icon,
        license,
        target_frameworks: frameworks.into_iter().collect(),
    })
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, ManifestError> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_owned();
    (!value.is_empty()).then_some(value)
}

/// Incremental state while walking the nuspec element tree.
#[derive(Debug, Default)]
struct NuspecWalker {
    manifest: Manifest,
    path: Vec<String>,
    text: String,
    group: Option<DependencyGroup>,
    ungrouped: Vec<Dependency>,
    license_kind: Option<String>,
}

impl NuspecWalker {
    fn in_metadata(&self) -> bool {
        self.path.len() >= 2 && self.path[0] == "package" && self.path[1] == "metadata"
    }

    fn open(&mut self, element: &BytesStart<'_>, empty: bool) -> Result<(), ManifestError> {
        let name = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();

        if self.in_metadata() || (self.path.len() == 1 && name == "metadata") {
            match name.as_str() {
                "metadata" => {
                    self.manifest.min_client_version = attribute(element, b"minClientVersion")?;
                }
                "license" => {
                    self.license_kind = attribute(element, b"type")?;
                }
                "repository" => {
                    self.manifest.repository_url = attribute(element, b"url")?;
                    self.manifest.repository_type = attribute(element, b"type")?;
                }
                "group" => {
                    self.group = Some(DependencyGroup {
                        target_framework: attribute(element, b"targetFramework")?,
                        dependencies: Vec::new(),
                    });
                }
                "dependency" if self.path.iter().any(|p| p == "dependencies") => {
                    let id = attribute(element, b"id")?
                        .ok_or(ManifestError::MissingElement("dependency id"))?;
                    let dependency = Dependency {
                        id,
                        range: attribute(element, b"version")?,
                    };
                    match self.group.as_mut() {
                        Some(group) => group.dependencies.push(dependency),
                        None => self.ungrouped.push(dependency),
                    }
                }
                "packageType" => {
                    if let Some(kind) = attribute(element, b"name")? {
                        self.manifest.package_types.push(kind);
                    }
                }
                _ => {}
            }
        }

        if empty {
            if name == "group" {
                self.close_group();
            }
        } else {
            self.path.push(name);
            self.text.clear();
        }
        Ok(())
    }

    fn close_group(&mut self) {
        if let Some(group) = self.group.take() {
            self.manifest.dependency_groups.push(group);
        }
    }

    fn close(&mut self) {
        let Some(name) = self.path.pop() else {
            return;
        };
        let text = std::mem::take(&mut self.text);

        // Only direct children of <metadata> carry scalar fields.
        if self.path.len() != 2 || !self.in_metadata() {
            if name == "group" {
                self.close_group();
            }
            return;
        }

        let m = &mut self.manifest;
        match name.as_str() {
            "id" => m.id = text.trim().to_owned(),
            "version" => m.version = text.trim().to_owned(),
            "authors" => {
                m.authors = text
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_owned)
                    .collect()
            }
            "description" => m.description = text.trim().to_owned(),
            "summary" => m.summary = non_empty(text),
            "title" => m.title = non_empty(text),
            "tags" => {
                m.tags = text
                    .split([' ', ',', ';'])
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned)
                    .collect()
            }
            "projectUrl" => m.project_url = non_empty(text),
            "iconUrl" => m.icon_url = non_empty(text),
            "licenseUrl" => m.license_url = non_empty(text),
            "releaseNotes" => m.release_notes = non_empty(text),
            "requireLicenseAcceptance" => {
                m.require_license_acceptance = text.trim().eq_ignore_ascii_case("true")
            }
            "readme" => m.readme = non_empty(text),
            "icon" => m.icon = non_empty(text),
            "license" => match self.license_kind.take().as_deref() {
                Some("file") => m.license_file = non_empty(text),
                _ => m.license_expression = non_empty(text),
            },
            _ => {}
        }
    }
}

/// Parse a `.nuspec` manifest.
///
/// Only structural problems are reported here; the id and version are
/// validated by [`read_package`].
pub fn parse_nuspec(xml: &[u8]) -> Result<Manifest, ManifestError> {
    let xml = xml.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(xml);
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut walker = NuspecWalker::default();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => walker.open(&element, false)?,
            Event::Empty(element) => walker.open(&element, true)?,
            Event::Text(text) => walker.text.push_str(&text.unescape()?),
            Event::CData(data) => walker
                .text
                .push_str(&String::from_utf8_lossy(&data.into_inner())),
            Event::End(_) => walker.close(),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !walker.path.is_empty() {
        return Err(ManifestError::Xml("unexpected end of document".into()));
    }

    let mut manifest = walker.manifest;
    if !walker.ungrouped.is_empty() {
        manifest.dependency_groups.insert(
            0,
            DependencyGroup {
                target_framework: None,
                dependencies: walker.ungrouped,
            },
        );
    }
    if manifest.id.is_empty() {
        return Err(ManifestError::MissingElement("id"));
    }
    if manifest.version.is_empty() {
        return Err(ManifestError::MissingElement("version"));
    }
    if manifest.package_types.is_empty() {
        manifest.package_types.push("Dependency".to_owned());
    }
    Ok(manifest)
}
