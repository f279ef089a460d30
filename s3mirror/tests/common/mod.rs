use std::time::Duration;

use camino::Utf8Path;

pub fn write_file(root: &Utf8Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Sorted relative paths of all files below `root`, with directories
/// carrying a trailing slash.
pub fn tree(root: &Utf8Path) -> Vec<String> {
    let mut entries: Vec<String> = walkdir::WalkDir::new(root.as_std_path())
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let mut relative = entry
                .path()
                .strip_prefix(root.as_std_path())
                .unwrap()
                .to_str()
                .unwrap()
                .to_owned();
            if entry.file_type().is_dir() {
                relative.push('/');
            }
            relative
        })
        .collect();
    entries.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));
    entries
}

/// Polls `predicate` until it holds or the deadline passes.
pub async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
