#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use chrono::TimeZone;

#[test]
fn test_trace_disabled_values() {
    for value in ["", "0", "no", "  "] {
        assert_eq!(TraceConfig::parse(value), TraceConfig::Disabled, "value {value:?}");
    }
}

#[test]
fn test_trace_enabled_uses_default_files() {
    for value in ["1", "yes"] {
        assert_eq!(
            TraceConfig::parse(value),
            TraceConfig::Enabled {
                trace_path: PathBuf::from("trace.out"),
                cpu_path: PathBuf::from("pprof.cpu"),
            }
        );
    }
}

/// Test any other value names the trace file
#[test]
fn test_trace_custom_path() {
    let config = TraceConfig::parse("/tmp/destroy.trace");

    assert!(config.is_enabled());
    assert_eq!(
        config,
        TraceConfig::Enabled {
            trace_path: PathBuf::from("/tmp/destroy.trace"),
            cpu_path: PathBuf::from("/tmp/destroy.trace.prof.cpu"),
        }
    );
}

#[test]
fn test_default_debug_log_path() {
    let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

    let path = default_debug_log_path(Path::new("/tmp/dhctl"), now);

    assert_eq!(path, PathBuf::from("/tmp/dhctl/dhctl-destroy-20240309-140507.log"));
}

#[test]
fn test_create_log_file_makes_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs/nested/debug.log");

    create_log_file(&path).unwrap();

    assert!(path.exists());
}
