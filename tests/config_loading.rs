//! Configuration loading and validation.

use rust_workcell::config::{ConfigError, TransportConfig, WorkcellConfig};
use rust_workcell::pal::MethodKind;
use std::path::Path;

fn write(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("workcell.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_shipped_config_is_valid() {
    let config = WorkcellConfig::load_from("config/workcell.toml").unwrap();
    assert_eq!(config.pal.custom_positions.len(), 2);
    assert!(config.pal.triggers.is_some());
    assert_eq!(config.pal.transport, TransportConfig::Simulated);
    // listed but left empty
    let err = config
        .pal
        .method_file(MethodKind::HeadspaceInjection)
        .unwrap_err();
    assert!(err.to_string().contains("not configured"));
    assert!(config.pal.method_file(MethodKind::Archive).is_ok());
    assert!(config.motion.instrument_calibration.is_some());
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = WorkcellConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.application.log_level, "info");
    assert!(config.pal.methods.is_empty());
    assert_eq!(config.motion.axes.get("z"), Some(&2));
}

#[test]
fn test_ssh_transport_parses() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        r#"
[pal.transport]
kind = "ssh"
host = "pal-pc"
program = "C:\\PAL\\run.exe"
"#,
    );
    let config = WorkcellConfig::load_from(path).unwrap();
    match config.pal.transport {
        TransportConfig::Ssh { host, port, user, .. } => {
            assert_eq!(host, "pal-pc");
            assert_eq!(port, 22);
            assert_eq!(user, None);
        }
        other => panic!("unexpected transport {:?}", other),
    }
}

#[test]
fn test_validation_rejects_bad_values() {
    let cases = [
        ("[application]\nlog_level = \"loud\"\n", "log_level"),
        ("[pal.methods]\nteleport = \"x.cam\"\n", "teleport"),
        (
            "[[pal.custom_positions]]\nname = \"a\"\n[[pal.custom_positions]]\nname = \"a\"\n",
            "Duplicate",
        ),
        (
            "[pal.triggers]\nstart_line = 1\ncontinue_line = 1\ndone_line = 2\n",
            "distinct",
        ),
        (
            "[pal.transport]\nkind = \"ssh\"\nhost = \" \"\nprogram = \"run.exe\"\n",
            "host",
        ),
        (
            "[motion]\nplate_affine = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 1.0, 1.0]]\n",
            "last row",
        ),
        (
            "[motion]\ninstrument_calibration = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 2.0]]\n",
            "instrument_calibration",
        ),
        ("[[pal.custom_positions]]\nname = \"tray\"\n", "tray"),
        ("[[pal.custom_positions]]\nname = \"cell;1\"\n", "separator"),
    ];
    for (body, needle) in cases {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkcellConfig::load_from(write(dir.path(), body)).unwrap_err();
        match err {
            ConfigError::ValidationError(msg) => assert!(msg.contains(needle), "{}", msg),
            other => panic!("expected validation error for {:?}, got {}", body, other),
        }
    }
}
