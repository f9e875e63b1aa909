//! In-memory package archives and a scripted upstream for unit tests.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::id::PackageId;
use crate::mirror::{UpstreamError, UpstreamFeed, UpstreamVersion};
use crate::version::PackageVersion;

#[derive(Debug, Clone)]
pub(crate) struct PackageBuilder {
    id: String,
    version: String,
    description: String,
    tags: Vec<String>,
    readme: Option<String>,
    groups: BTreeMap<Option<String>, Vec<(String, String)>>,
    package_types: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
    nuspec: bool,
}

impl PackageBuilder {
    pub(crate) fn new(id: &str, version: &str) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            description: format!("The {id} package"),
            tags: Vec::new(),
            readme: None,
            groups: BTreeMap::new(),
            package_types: Vec::new(),
            files: Vec::new(),
            nuspec: true,
        }
    }

    pub(crate) fn description(mut self, description: &str) -> Self {
        self.description = description.into();
        self
    }

    pub(crate) fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub(crate) fn package_type(mut self, kind: &str) -> Self {
        self.package_types.push(kind.into());
        self
    }

    pub(crate) fn dependency(mut self, framework: Option<&str>, id: &str, range: &str) -> Self {
        self.groups
            .entry(framework.map(str::to_owned))
            .or_default()
            .push((id.into(), range.into()));
        self
    }

    pub(crate) fn declare_readme(mut self, path: &str) -> Self {
        self.readme = Some(path.into());
        self
    }

    pub(crate) fn readme(self, path: &str, contents: &str) -> Self {
        self.declare_readme(path).file(path, contents.as_bytes())
    }

    pub(crate) fn file(mut self, path: &str, contents: &[u8]) -> Self {
        self.files.push((path.into(), contents.to_vec()));
        self
    }

    pub(crate) fn without_nuspec(mut self) -> Self {
        self.nuspec = false;
        self
    }

    fn manifest(&self) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<package xmlns=\"http://schemas.microsoft.com/packaging/2013/05/nuspec.xsd\">\n  <metadata>\n",
        );
        xml.push_str(&format!("    <id>{}</id>\n", self.id));
        xml.push_str(&format!("    <version>{}</version>\n", self.version));
        xml.push_str("    <authors>Test Author</authors>\n");
        xml.push_str(&format!("    <description>{}</description>\n", self.description));
        if !self.tags.is_empty() {
            xml.push_str(&format!("    <tags>{}</tags>\n", self.tags.join(" ")));
        }
        if let Some(readme) = &self.readme {
            xml.push_str(&format!("    <readme>{readme}</readme>\n"));
        }
        if !self.package_types.is_empty() {
            xml.push_str("    <packageTypes>\n");
            for kind in &self.package_types {
                xml.push_str(&format!("      <packageType name=\"{kind}\" />\n"));
            }
            xml.push_str("    </packageTypes>\n");
        }
        if !self.groups.is_empty() {
            xml.push_str("    <dependencies>\n");
            for (framework, dependencies) in &self.groups {
                match framework {
                    Some(tfm) => xml.push_str(&format!("      <group targetFramework=\"{tfm}\">\n")),
                    None => xml.push_str("      <group>\n"),
                }
                for (id, range) in dependencies {
                    xml.push_str(&format!(
                        "        <dependency id=\"{id}\" version=\"{range}\" />\n"
                    ));
                }
                xml.push_str("      </group>\n");
            }
            xml.push_str("    </dependencies>\n");
        }
        xml.push_str("  </metadata>\n</package>\n");
        xml
    }

    pub(crate) fn build(&self) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();

        if self.nuspec {
            writer
                .start_file(format!("{}.nuspec", self.id), options)
                .unwrap();
            writer.write_all(self.manifest().as_bytes()).unwrap();
        }
        for (path, contents) in &self.files {
            writer.start_file(path.as_str(), options).unwrap();
            writer.write_all(contents).unwrap();
        }

        writer.finish().unwrap().into_inner().into()
    }
}

#[derive(Debug, Clone)]
struct Published {
    id: String,
    version: PackageVersion,
    listed: bool,
    data: Bytes,
}

/// An upstream feed held in memory, counting downloads.
#[derive(Debug, Default)]
pub(crate) struct FakeUpstream {
    packages: Mutex<Vec<Published>>,
    downloads: AtomicUsize,
    failures: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
    pub(crate) started: Notify,
}

impl FakeUpstream {
    pub(crate) fn new() -> Arc<Self> {
        Arc::default()
    }

    pub(crate) fn publish(&self, id: &str, version: &str, listed: bool) -> Bytes {
        let data = PackageBuilder::new(id, version).build();
        self.packages.lock().push(Published {
            id: id.to_ascii_lowercase(),
            version: PackageVersion::parse(version).unwrap(),
            listed,
            data: data.clone(),
        });
        data
    }

    pub(crate) fn set_listed(&self, id: &str, version: &str, listed: bool) {
        let version = PackageVersion::parse(version).unwrap();
        for package in self.packages.lock().iter_mut() {
            if package.id == id.to_ascii_lowercase() && package.version == version {
                package.listed = listed;
            }
        }
    }

    /// Serve `data` as the content of a published version.
    pub(crate) fn serve(&self, id: &str, version: &str, data: Bytes) {
        let version = PackageVersion::parse(version).unwrap();
        for package in self.packages.lock().iter_mut() {
            if package.id == id.to_ascii_lowercase() && package.version == version {
                package.data = data.clone();
            }
        }
    }

    /// Fail the next `count` downloads with a transient error.
    pub(crate) fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make downloads wait for a permit on the returned semaphore.
    pub(crate) fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub(crate) fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl UpstreamFeed for FakeUpstream {
    async fn versions(&self, id: &PackageId) -> Result<Option<Vec<UpstreamVersion>>, UpstreamError> {
        let mut versions: Vec<UpstreamVersion> = self
            .packages
            .lock()
            .iter()
            .filter(|p| p.id == id.normalized())
            .map(|p| UpstreamVersion {
                version: p.version.clone(),
                listed: p.listed,
            })
            .collect();
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok((!versions.is_empty()).then_some(versions))
    }

    async fn download(
        &self,
        id: &PackageId,
        version: &PackageVersion,
    ) -> Result<Option<Bytes>, UpstreamError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(UpstreamError::Transient("503 Service Unavailable".into()));
        }

        Ok(self
            .packages
            .lock()
            .iter()
            .find(|p| p.id == id.normalized() && &p.version == version)
            .map(|p| p.data.clone()))
    }
}
