use camino::{Utf8Path, Utf8PathBuf};

/// Lists the input image files for a generation run.
///
/// A file path is returned as-is; a directory is expanded one level. Entries
/// are sorted for a deterministic processing order and capped at `limit`
/// input files when the limit is positive (zero or negative disables the
/// cap).
pub fn list_input_files(input_path: &Utf8Path, limit: i64) -> Vec<Utf8PathBuf> {
    let mut files: Vec<Utf8PathBuf> = if input_path.is_file() {
        vec![input_path.to_owned()]
    } else if input_path.is_dir() {
        let mut found = vec![];
        for entry_result in input_path
            .read_dir_utf8()
            .unwrap_or_else(|_| panic!("failed reading directory: {input_path}"))
        {
            match entry_result {
                Ok(entry) => {
                    let entry_path = entry.into_path();
                    if entry_path.is_file() {
                        found.push(entry_path);
                    } else {
                        eprintln!(
                            "Warning: skipping directory entry that is not a file: {entry_path}"
                        );
                    }
                }
                Err(e) => panic!("Issue reading directory entry: {e:?}"),
            }
        }
        found
    } else {
        vec![]
    };

    files.sort();
    files.dedup();
    if limit > 0 && files.len() > limit as usize {
        files.truncate(limit as usize);
    }
    files
}
