//! Requirement inference from repository manifests and issue text.
//!
//! Every capability has an ordered list of manifest sources; the first one
//! that yields a parsable range wins and later disagreeing sources are
//! reported as conflicts. Keywords in the issue text are a weaker signal and
//! only add capabilities no manifest mentioned. When nothing is detected the
//! configured default profile applies.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::matcher::PlatformCatalog;
use super::profile::{CapabilityProfile, Requirement, RequirementSet};
use super::version::VersionReq;

/// Manifest file name to contents.
#[derive(Debug, Clone, Default)]
pub struct Manifests {
    files: BTreeMap<String, String>,
}

const KNOWN_MANIFESTS: &[&str] = &[
    ".nvmrc",
    ".node-version",
    "package.json",
    ".python-version",
    "runtime.txt",
    "pyproject.toml",
    "global.json",
    ".java-version",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "go.mod",
    "rust-toolchain.toml",
    "rust-toolchain",
    "Cargo.toml",
    ".ruby-version",
    "Gemfile",
    "composer.json",
];

impl Manifests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.insert(name, contents);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, contents: impl Into<String>) {
        self.files.insert(name.into(), contents.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    /// First file (by name) whose name ends with `suffix`.
    fn find_suffix(&self, suffix: &str) -> Option<(&str, &str)> {
        self.files
            .iter()
            .find(|(name, _)| name.ends_with(suffix))
            .map(|(n, c)| (n.as_str(), c.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Reads the known manifest files from the top level of `dir`.
    /// Missing or unreadable files are skipped.
    pub async fn read_from(dir: &Path) -> Self {
        let mut manifests = Self::new();
        for name in KNOWN_MANIFESTS {
            if let Ok(contents) = tokio::fs::read_to_string(dir.join(name)).await {
                manifests.insert(*name, contents);
            }
        }

        if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".csproj") {
                    if let Ok(contents) = tokio::fs::read_to_string(entry.path()).await {
                        manifests.insert(name, contents);
                    }
                }
            }
        }

        tracing::debug!(dir = %dir.display(), files = manifests.files.len(), "Read manifests");
        manifests
    }
}

/// Inputs for inference.
#[derive(Debug, Clone, Copy)]
pub struct TaskMetadata<'a> {
    pub manifests: &'a Manifests,
    pub issue_text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub capability: String,
    pub range: VersionReq,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub chosen: Signal,
    pub ignored: Signal,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Inference {
    pub requirements: RequirementSet,
    pub signals: Vec<Signal>,
    pub conflicts: Vec<Conflict>,
    pub used_default: bool,
}

type Extractor = fn(&Manifests) -> Option<(String, String)>;

/// Per capability, manifest extractors in precedence order. Each returns
/// the source file name and the raw range text.
const DETECTORS: &[(&str, &[Extractor])] = &[
    ("nodejs", &[nvmrc, node_version_file, package_engines]),
    ("python", &[python_version_file, runtime_txt, pyproject]),
    ("dotnet", &[global_json, csproj]),
    ("java", &[java_version_file, pom_xml, gradle]),
    ("golang", &[go_toolchain, go_directive]),
    ("rust", &[rust_toolchain_toml, rust_toolchain_legacy, cargo_rust_version]),
    ("ruby", &[ruby_version_file, gemfile]),
    ("php", &[composer_json]),
];

const KEYWORDS: &[(&str, &[&str])] = &[
    (
        "nodejs",
        &[
            "node", "nodejs", "node.js", "npm", "yarn", "javascript", "typescript", "react", "vue",
            "angular",
        ],
    ),
    ("dotnet", &[".net", "dotnet", "csharp", "c#", "asp.net"]),
    ("python", &["python", "django", "flask", "fastapi", "pip", "pytest"]),
    ("java", &["java", "maven", "gradle", "spring"]),
    ("golang", &["golang"]),
    ("rust", &["rust", "cargo"]),
    ("ruby", &["ruby", "rails"]),
    ("php", &["php", "laravel", "composer"]),
];

/// Capabilities whose keywords appear as whole words in `text`.
pub fn keywords_in(text: &str) -> Vec<&'static str> {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| c.is_whitespace() || ",;:()[]{}\"'`!?/<>*".contains(c))
        .map(|w| w.trim_end_matches('.'))
        .filter(|w| !w.is_empty())
        .collect();

    KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| words.contains(k)))
        .map(|(capability, _)| *capability)
        .collect()
}

/// Requirement inference with the fallbacks it needs.
#[derive(Debug, Clone)]
pub struct Detector {
    catalog: PlatformCatalog,
    default_profile: CapabilityProfile,
}

impl Detector {
    pub fn new(catalog: PlatformCatalog, default_profile: CapabilityProfile) -> Self {
        Self {
            catalog,
            default_profile,
        }
    }

    /// Never fails: unparsable manifests are skipped and an empty result
    /// falls back to the default profile.
    pub fn infer_requirements(&self, metadata: &TaskMetadata<'_>) -> RequirementSet {
        self.analyze(metadata).requirements
    }

    pub fn analyze(&self, metadata: &TaskMetadata<'_>) -> Inference {
        let mut inference = Inference::default();

        for (capability, extractors) in DETECTORS {
            let mut chosen: Option<Signal> = None;
            for extract in extractors.iter() {
                let Some((source, raw)) = extract(metadata.manifests) else {
                    continue;
                };
                let range = match raw.parse::<VersionReq>() {
                    Ok(range) => range,
                    Err(e) => {
                        tracing::debug!(capability, source = %source, error = %e, "Ignoring unparsable version");
                        continue;
                    }
                };
                let signal = Signal {
                    capability: capability.to_string(),
                    range,
                    source,
                };
                inference.signals.push(signal.clone());
                let Some(first) = &chosen else {
                    chosen = Some(signal);
                    continue;
                };
                if !first.range.is_compatible_with(&signal.range) {
                    tracing::warn!(
                        capability,
                        chosen = %first.range,
                        chosen_source = %first.source,
                        ignored = %signal.range,
                        ignored_source = %signal.source,
                        "Conflicting version sources"
                    );
                    inference.conflicts.push(Conflict {
                        chosen: first.clone(),
                        ignored: signal,
                    });
                }
            }
            if let Some(signal) = chosen {
                inference
                    .requirements
                    .insert(Requirement::new(signal.capability, signal.range));
            }
        }

        for capability in keywords_in(metadata.issue_text) {
            if inference.requirements.contains(capability) {
                continue;
            }
            let range = self
                .catalog
                .default_version(capability)
                .map(VersionReq::exact)
                .unwrap_or_else(VersionReq::any);
            inference.signals.push(Signal {
                capability: capability.to_string(),
                range: range.clone(),
                source: "issue text".to_string(),
            });
            inference
                .requirements
                .insert(Requirement::new(capability, range));
        }

        if inference.requirements.is_empty() {
            inference.requirements = RequirementSet::from_profile(&self.default_profile);
            inference.used_default = true;
        }

        inference
    }
}

fn first_line(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
}

fn compile(pattern: &str) -> Regex {
    // Literal patterns, all exercised by the tests below.
    Regex::new(pattern).expect("manifest pattern must compile")
}

static RUNTIME_TXT: LazyLock<Regex> = LazyLock::new(|| compile(r"python-(\d+(?:\.\d+){0,2})"));
static TARGET_FRAMEWORK: LazyLock<Regex> =
    LazyLock::new(|| compile(r"<TargetFrameworks?>\s*net(\d+\.\d+)"));
static POM_JAVA: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"<(?:maven\.compiler\.release|maven\.compiler\.source|java\.version)>\s*([\d.]+)\s*<")
});
static GRADLE_JAVA: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        compile(r"JavaLanguageVersion\.of\(\s*(\d+)\s*\)"),
        compile(r"sourceCompatibility\s*=\s*JavaVersion\.VERSION_([\d_]+)"),
        compile(r#"sourceCompatibility\s*=\s*['"]?([\d.]+)"#),
    ]
});
static GO_TOOLCHAIN: LazyLock<Regex> =
    LazyLock::new(|| compile(r"(?m)^toolchain\s+go(\d+(?:\.\d+){0,2})"));
static GO_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| compile(r"(?m)^go\s+(\d+(?:\.\d+){0,2})"));
static GEMFILE_RUBY: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"(?m)^\s*ruby\s+['"]([^'"]+)['"]"#));

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn from_file(
    manifests: &Manifests,
    name: &str,
    parse: impl FnOnce(&str) -> Option<String>,
) -> Option<(String, String)> {
    let contents = manifests.get(name)?;
    parse(contents).map(|raw| (name.to_string(), raw))
}

/// Java versions below 9 are spelled `1.8`.
fn normalize_java(raw: &str) -> String {
    let raw = raw.replace('_', ".");
    match raw.strip_prefix("1.") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => raw,
    }
}

fn node_line(contents: &str) -> Option<String> {
    first_line(contents).map(|l| l.trim_start_matches('v').to_string())
}

fn nvmrc(m: &Manifests) -> Option<(String, String)> {
    from_file(m, ".nvmrc", node_line)
}

fn node_version_file(m: &Manifests) -> Option<(String, String)> {
    from_file(m, ".node-version", node_line)
}

fn package_engines(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "package.json", |c| {
        let json: serde_json::Value = serde_json::from_str(c).ok()?;
        json.pointer("/engines/node")?.as_str().map(str::to_string)
    })
}

fn python_version_file(m: &Manifests) -> Option<(String, String)> {
    from_file(m, ".python-version", first_line)
}

fn runtime_txt(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "runtime.txt", |c| capture(&RUNTIME_TXT, c))
}

fn pyproject(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "pyproject.toml", |c| {
        let doc: toml::Table = c.parse().ok()?;
        let requires = doc
            .get("project")
            .and_then(|p| p.get("requires-python"))
            .or_else(|| {
                doc.get("tool")
                    .and_then(|t| t.get("poetry"))
                    .and_then(|p| p.get("dependencies"))
                    .and_then(|d| d.get("python"))
            })?;
        requires.as_str().map(str::to_string)
    })
}

fn global_json(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "global.json", |c| {
        let json: serde_json::Value = serde_json::from_str(c).ok()?;
        let sdk = json.pointer("/sdk/version")?.as_str()?;
        // SDK feature bands (8.0.100) map to the runtime major.minor.
        let mut parts = sdk.split('.');
        Some(format!("{}.{}", parts.next()?, parts.next()?))
    })
}

fn csproj(m: &Manifests) -> Option<(String, String)> {
    let (name, contents) = m.find_suffix(".csproj")?;
    capture(&TARGET_FRAMEWORK, contents).map(|v| (name.to_string(), v))
}

fn java_version_file(m: &Manifests) -> Option<(String, String)> {
    from_file(m, ".java-version", |c| first_line(c).map(|l| normalize_java(&l)))
}

fn pom_xml(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "pom.xml", |c| {
        capture(&POM_JAVA, c).map(|v| normalize_java(&v))
    })
}

fn gradle(m: &Manifests) -> Option<(String, String)> {
    ["build.gradle", "build.gradle.kts"].iter().find_map(|name| {
        from_file(m, name, |c| {
            GRADLE_JAVA
                .iter()
                .find_map(|re| capture(re, c))
                .map(|v| normalize_java(&v))
        })
    })
}

fn go_toolchain(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "go.mod", |c| capture(&GO_TOOLCHAIN, c))
}

fn go_directive(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "go.mod", |c| {
        capture(&GO_DIRECTIVE, c).map(|v| format!(">={v}"))
    })
}

fn numeric_channel(channel: &str) -> Option<String> {
    channel
        .chars()
        .next()
        .filter(char::is_ascii_digit)
        .map(|_| channel.to_string())
}

fn rust_toolchain_toml(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "rust-toolchain.toml", |c| {
        let doc: toml::Table = c.parse().ok()?;
        let channel = doc.get("toolchain")?.get("channel")?.as_str()?;
        numeric_channel(channel)
    })
}

fn rust_toolchain_legacy(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "rust-toolchain", |c| first_line(c).and_then(|l| numeric_channel(&l)))
}

fn cargo_rust_version(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "Cargo.toml", |c| {
        let doc: toml::Table = c.parse().ok()?;
        let msrv = doc.get("package")?.get("rust-version")?.as_str()?;
        Some(format!(">={msrv}"))
    })
}

fn ruby_version_file(m: &Manifests) -> Option<(String, String)> {
    from_file(m, ".ruby-version", |c| {
        first_line(c).map(|l| l.trim_start_matches("ruby-").to_string())
    })
}

fn gemfile(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "Gemfile", |c| capture(&GEMFILE_RUBY, c))
}

fn composer_json(m: &Manifests) -> Option<(String, String)> {
    from_file(m, "composer.json", |c| {
        let json: serde_json::Value = serde_json::from_str(c).ok()?;
        json.pointer("/require/php")?.as_str().map(str::to_string)
    })
}
