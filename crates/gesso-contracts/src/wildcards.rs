use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One wildcard dictionary: a named list of interchangeable options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildcardFile {
    pub name: String,
    pub options: Vec<String>,
}

/// Directory-backed store of wildcard dictionaries.
///
/// Files are `<name>.txt` under the root (subdirectories allowed,
/// names use `/`), one option per line. Blank lines and `#` comments
/// are skipped. A missing root behaves as an empty store.
#[derive(Debug, Clone)]
pub struct WildcardStore {
    root: PathBuf,
}

impl WildcardStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_files(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_txt_files(&self.root, "", &mut names);
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<WildcardFile> {
        let path = self.root.join(format!("{name}.txt"));
        let raw = std::fs::read_to_string(path).ok()?;
        let options = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect::<Vec<String>>();
        Some(WildcardFile {
            name: name.to_string(),
            options,
        })
    }
}

fn collect_txt_files(dir: &Path, prefix: &str, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if path.is_dir() {
            let nested = if prefix.is_empty() {
                file_name.to_string()
            } else {
                format!("{prefix}/{file_name}")
            };
            collect_txt_files(&path, &nested, out);
        } else if let Some(stem) = file_name.strip_suffix(".txt") {
            if prefix.is_empty() {
                out.push(stem.to_string());
            } else {
                out.push(format!("{prefix}/{stem}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn lists_nested_files_and_reads_options() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("colors.txt"), "red\ngreen\n\n# comment\nblue\n")?;
        fs::create_dir(temp.path().join("styles"))?;
        fs::write(temp.path().join("styles/painters.txt"), "impressionist\n")?;

        let store = WildcardStore::new(temp.path());
        assert_eq!(store.list_files(), vec!["colors", "styles/painters"]);

        let file = store.get("colors").unwrap();
        assert_eq!(file.options, vec!["red", "green", "blue"]);
        Ok(())
    }

    #[test]
    fn missing_root_is_empty() {
        let store = WildcardStore::new("/nonexistent/gesso-wildcards");
        assert!(store.list_files().is_empty());
        assert!(store.get("anything").is_none());
    }
}
