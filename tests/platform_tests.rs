use issue_dispatch::platform::{
    satisfies, select_template, CapabilityProfile, Detector, Manifests, PlatformCatalog,
    PlatformSpec, RequirementSet, TaskMetadata, Version, WorkerTemplate,
};

fn default_detector() -> Detector {
    Detector::new(
        PlatformCatalog::default(),
        CapabilityProfile::new().with("nodejs", Version::new(18, 16, 0)),
    )
}

fn template(name: &str, pairs: &str) -> WorkerTemplate {
    WorkerTemplate {
        name: name.to_string(),
        image: Some(format!("bot-{name}:latest")),
        capabilities: CapabilityProfile::parse_pairs(pairs).unwrap(),
    }
}

#[test]
fn test_manifest_beats_issue_keywords() {
    let manifests = Manifests::new()
        .with(".nvmrc", "v20.11.1\n")
        .with("package.json", r#"{"engines": {"node": ">=20"}}"#);

    let inference = default_detector().analyze(&TaskMetadata {
        manifests: &manifests,
        issue_text: "The node build fails under npm 10",
    });

    assert!(!inference.used_default);
    assert!(inference.conflicts.is_empty());
    let node = inference.requirements.get("nodejs").unwrap();
    assert_eq!(node.range.as_str(), "20.11.1");
    assert_eq!(inference.requirements.len(), 1);
}

#[test]
fn test_conflicting_manifests_keep_highest_precedence() {
    let manifests = Manifests::new()
        .with(".nvmrc", "18")
        .with("package.json", r#"{"engines": {"node": "^20"}}"#);

    let inference = default_detector().analyze(&TaskMetadata {
        manifests: &manifests,
        issue_text: "",
    });

    assert_eq!(
        inference.requirements.get("nodejs").unwrap().range.as_str(),
        "18"
    );
    assert_eq!(inference.conflicts.len(), 1);
    assert_eq!(inference.conflicts[0].chosen.source, ".nvmrc");
    assert_eq!(inference.conflicts[0].ignored.source, "package.json");
}

#[test]
fn test_multi_platform_repository() {
    let manifests = Manifests::new()
        .with("package.json", r#"{"engines": {"node": ">=18"}}"#)
        .with(
            "pyproject.toml",
            "[project]\nname = \"api\"\nrequires-python = \">=3.10\"\n",
        )
        .with("go.mod", "module example.com/x\n\ngo 1.21\n");

    let requirements = default_detector().infer_requirements(&TaskMetadata {
        manifests: &manifests,
        issue_text: "Please also fix the Django admin",
    });

    assert_eq!(requirements.len(), 3);
    assert!(requirements.contains("nodejs"));
    assert!(requirements.contains("python"));
    assert!(requirements.contains("golang"));

    let profile = CapabilityProfile::parse_pairs("nodejs:20.11.1,python:3.12,golang:1.22").unwrap();
    assert!(satisfies(&profile, &requirements));
    let too_old = CapabilityProfile::parse_pairs("nodejs:20.11.1,python:3.9,golang:1.22").unwrap();
    assert!(!satisfies(&too_old, &requirements));
}

#[test]
fn test_keywords_use_catalog_defaults() {
    let requirements = default_detector().infer_requirements(&TaskMetadata {
        manifests: &Manifests::new(),
        issue_text: "Spring Boot service returns 500 on /health",
    });

    let java = requirements.get("java").unwrap();
    assert!(java.range.matches(&"17".parse().unwrap()));
    assert!(!java.range.matches(&"21".parse().unwrap()));
}

#[test]
fn test_no_signal_falls_back_to_default_profile() {
    let inference = default_detector().analyze(&TaskMetadata {
        manifests: &Manifests::new().with("README.md", "hello"),
        issue_text: "Typo on the about page",
    });

    assert!(inference.used_default);
    let node = inference.requirements.get("nodejs").unwrap();
    assert!(node.range.matches(&Version::new(18, 16, 0)));
}

#[tokio::test]
async fn test_manifests_read_from_checkout() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".python-version"), "3.11.4\n").unwrap();
    std::fs::write(
        dir.path().join("Api.csproj"),
        "<Project><PropertyGroup><TargetFramework>net8.0</TargetFramework></PropertyGroup></Project>",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let manifests = Manifests::read_from(dir.path()).await;
    assert_eq!(manifests.get(".python-version"), Some("3.11.4\n"));
    assert!(manifests.get("notes.txt").is_none());

    let requirements = default_detector().infer_requirements(&TaskMetadata {
        manifests: &manifests,
        issue_text: "",
    });
    assert!(requirements.contains("python"));
    assert!(requirements.contains("dotnet"));
    assert!(requirements
        .get("dotnet")
        .unwrap()
        .range
        .matches(&"8.0".parse().unwrap()));
}

#[tokio::test]
async fn test_missing_checkout_reads_nothing() {
    let manifests = Manifests::read_from(std::path::Path::new("/nonexistent/checkout")).await;
    assert!(manifests.is_empty());
}

#[test]
fn test_template_selection_prefers_configured_order() {
    let templates = vec![
        template("node18", "nodejs:18.16.0"),
        template("polyglot", "nodejs:20.11.1,python:3.11"),
    ];

    let node_any = RequirementSet::new().require("nodejs", ">=18");
    assert_eq!(select_template(&templates, &node_any).unwrap().name, "node18");

    let node_python = RequirementSet::new()
        .require("nodejs", "20")
        .require("python", "~3.11");
    assert_eq!(
        select_template(&templates, &node_python).unwrap().name,
        "polyglot"
    );

    let java = RequirementSet::new().require("java", "17");
    assert!(select_template(&templates, &java).is_none());
}

#[test]
fn test_catalog_provisions_minimal_profiles() {
    let catalog = PlatformCatalog::default();
    let requirements = RequirementSet::new()
        .require("nodejs", "<20")
        .require("python", "3.x");

    let profile = catalog.minimal_profile_for(&requirements).unwrap();
    assert_eq!(profile.len(), 2);
    assert_eq!(profile.get("nodejs"), Some(&Version::new(18, 16, 0)));
    assert_eq!(profile.get("python"), Some(&"3.12".parse().unwrap()));
    assert!(satisfies(&profile, &requirements));
}

#[test]
fn test_catalog_reports_unmet_requirements() {
    let mut catalog = PlatformCatalog::empty();
    catalog.insert(
        "nodejs",
        PlatformSpec {
            default_version: Version::new(18, 16, 0),
            supported_versions: vec![Version::new(16, 20, 2)],
        },
    );
    let requirements = RequirementSet::new()
        .require("nodejs", ">=20")
        .require("elixir", "1.15");

    let missing = catalog.minimal_profile_for(&requirements).unwrap_err();
    let names: Vec<&str> = missing.iter().map(|r| r.capability.as_str()).collect();
    assert_eq!(names, vec!["nodejs", "elixir"]);
    assert!(!catalog.can_provision(&requirements));
}
