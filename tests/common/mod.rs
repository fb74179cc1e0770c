//! Shared fixtures for integration tests.

use std::path::Path;

use glacier::config::ProjectConfig;
use tempfile::TempDir;

fn copy_dir(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), target).unwrap();
        }
    }
}

/// Copy of the bundled glacier project (configuration and raw data)
pub fn project() -> TempDir {
    let source = Path::new(env!("CARGO_MANIFEST_DIR"));
    let temp = TempDir::new().unwrap();
    copy_dir(&source.join("conf"), &temp.path().join("conf"));
    copy_dir(&source.join("data/01_raw"), &temp.path().join("data/01_raw"));
    temp
}

/// The project's base configuration with session logs kept inside `project`
pub fn config(project: &TempDir) -> ProjectConfig {
    let config = ProjectConfig::load(project.path(), Some("base")).unwrap();
    ProjectConfig {
        home: project.path().join(".glacier"),
        ..config
    }
}
