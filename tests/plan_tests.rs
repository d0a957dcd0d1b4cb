//! Loading YAML test plans from disk, including the shipped plans.

use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::time::Duration;

use pagination_loadtest::config::{ConfigError, TestPlan};
use pagination_loadtest::worker::Pacing;

fn plan_path(name: &str) -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("plans").join(name)
}

#[test]
fn test_every_shipped_plan_is_valid() {
    let entries = fs::read_dir(Path::new(env!("CARGO_MANIFEST_DIR")).join("plans")).unwrap();
    let mut count = 0;
    for entry in entries {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let test = TestPlan::from_file(&path)
            .and_then(|plan| plan.to_load_test())
            .unwrap_or_else(|e| panic!("{}: {}", path.display(), e));

        assert_eq!(test.pacing, Pacing::Fixed(Duration::from_secs(1)));
        assert_eq!(test.scenario.name(), "pagination");
        assert!(test.run_tags.get("test_type").is_some());
        assert!(test.thresholds.specs().len() >= 4);
        count += 1;
    }
    assert_eq!(count, 5);
}

#[test]
fn test_shipped_plan_shapes() {
    let cases = [
        ("load.yaml", 26 * 60, 50, 200.0, 0.01),
        ("stress.yaml", 55 * 60, 100, 200.0, 0.01),
        ("soak.yaml", 68 * 60, 100, 250.0, 0.02),
        ("spike.yaml", 5 * 60, 500, 500.0, 0.1),
        ("breakpoint.yaml", 2 * 3600, 1000, 200.0, 0.01),
    ];

    for (file, secs, max, p95, rate) in cases {
        let test = TestPlan::from_file(plan_path(file)).unwrap().to_load_test().unwrap();
        assert_eq!(test.profile.total_duration(), Duration::from_secs(secs), "{}", file);
        assert_eq!(test.profile.max_target(), max, "{}", file);

        let bounds: Vec<(String, f64)> = test
            .thresholds
            .specs()
            .iter()
            .filter(|s| !s.abort_on_fail)
            .map(|s| (s.expression(), s.bound))
            .collect();
        assert!(bounds.iter().any(|(e, b)| e.starts_with("p(95)") && *b == p95), "{}: {:?}", file, bounds);
        assert!(bounds.iter().any(|(e, b)| e.starts_with("rate") && *b == rate), "{}: {:?}", file, bounds);
    }
}

#[test]
fn test_shipped_plans_run_to_completion() {
    for file in ["load.yaml", "stress.yaml", "soak.yaml", "spike.yaml", "breakpoint.yaml"] {
        let test = TestPlan::from_file(plan_path(file)).unwrap().to_load_test().unwrap();
        assert!(!test.thresholds.has_abort_thresholds(), "{}", file);
        assert_eq!(test.thresholds.specs().len(), 4, "{}", file);
        assert_eq!(test.profile.target_workers_at(Duration::ZERO), 1, "{}", file);
    }
}

#[test]
fn test_plan_from_temp_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
version: "1.0"
metadata:
  name: from-disk
stages:
  - {{ duration: 10s, target: 2 }}
scenario:
  name: pagination
  requests:
    - name: cursor-based
      url: "http://app:3030/users/cursor-based?cursor=22&limit=20"
      tags: {{ endpoint: cursor-based }}
"#
    )
    .unwrap();

    let test = TestPlan::from_file(file.path()).unwrap().to_load_test().unwrap();
    assert_eq!(test.name, "from-disk");
    assert_eq!(test.profile.max_target(), 2);
}

#[test]
fn test_missing_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = TestPlan::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::FileRead(_)));
}

#[test]
fn test_malformed_yaml_is_parse_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "version: [unterminated").unwrap();
    let err = TestPlan::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::YamlParse(_)));
}
