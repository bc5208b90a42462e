//! Snapshot file naming, directory handling, and boot-time load inference.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use darter_common::error::{DarterError, DarterResult};
use darter_common::ids::ShardId;

/// Formats one timestamp the way snapshot filenames embed it.
#[must_use]
pub fn format_ts(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Extends a base filename into its final snapshot name.
///
/// Legacy mode (`shard == None`) appends `-<ts>.rdb` unless the base already
/// carries an extension. Per-shard mode clears any extension and appends
/// `-<ts>-<shard:04>.dfs`.
pub fn extend_filename(now: DateTime<Local>, shard: Option<ShardId>, filename: &mut PathBuf) {
    let ts = format_ts(now);
    match shard {
        None => {
            if filename.extension().is_none() {
                let mut name = filename
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                name.push_str(&format!("-{ts}.rdb"));
                filename.set_file_name(name);
            }
        }
        Some(shard) => {
            filename.set_extension("");
            let mut name = filename
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.push_str(&format!("-{ts}-{shard:04}.dfs"));
            filename.set_file_name(name);
        }
    }
}

/// Creates the snapshot directory when it does not exist yet.
///
/// # Errors
///
/// Returns `DarterError::Io` when the directory cannot be created or is not
/// accessible.
pub fn create_dirs(dir_path: &Path) -> DarterResult<()> {
    match fs::metadata(dir_path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(DarterError::Io(format!(
            "{} exists and is not a directory",
            dir_path.display()
        ))),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(dir_path).map_err(|error| DarterError::io(&error))
        }
        Err(error) => Err(DarterError::io(&error)),
    }
}

/// What the boot path should load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// One legacy `.rdb` file.
    Single(PathBuf),
    /// One complete per-shard `.dfs` set; load order is irrelevant.
    ShardSet(Vec<PathBuf>),
}

/// Infers the snapshot to load at boot.
///
/// An exact `<dbfilename>` match wins. Otherwise, when the base name carries
/// no extension, the lexicographically last `<dbfilename>*.rdb` is chosen;
/// failing that, the newest complete `.dfs` timestamp group.
#[must_use]
pub fn infer_load_file(data_dir: &Path, dbfilename: &str) -> Option<LoadSource> {
    if dbfilename.is_empty() {
        return None;
    }

    let exact = data_dir.join(dbfilename);
    if exact.is_file() {
        return Some(LoadSource::Single(exact));
    }
    if exact.extension().is_some() {
        return None;
    }

    let mut rdb_candidates = Vec::new();
    let mut dfs_candidates = Vec::new();
    let entries = fs::read_dir(data_dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !name.starts_with(dbfilename) {
            continue;
        }
        if name.ends_with(".rdb") {
            rdb_candidates.push(path);
        } else if name.ends_with(".dfs") {
            dfs_candidates.push(path);
        }
    }

    rdb_candidates.sort();
    if let Some(latest) = rdb_candidates.pop() {
        return Some(LoadSource::Single(latest));
    }

    // Group .dfs files by everything before the 4-digit shard suffix so one
    // save's N files stay together, then take the newest group.
    dfs_candidates.sort();
    let mut groups: Vec<(String, Vec<PathBuf>)> = Vec::new();
    for path in dfs_candidates {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(prefix) = name
            .strip_suffix(".dfs")
            .and_then(|stem| stem.rsplit_once('-'))
            .map(|(prefix, _)| prefix.to_owned())
        else {
            continue;
        };
        if let Some((_, members)) = groups.iter_mut().find(|(key, _)| *key == prefix) {
            members.push(path);
        } else {
            groups.push((prefix, vec![path]));
        }
    }
    groups
        .into_iter()
        .max_by(|(left, _), (right, _)| left.cmp(right))
        .map(|(_, members)| LoadSource::ShardSet(members))
}

#[cfg(test)]
mod tests {
    use super::{LoadSource, create_dirs, extend_filename, infer_load_file};
    use chrono::{Local, TimeZone};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::path::PathBuf;

    fn fixed_now() -> chrono::DateTime<Local> {
        Local
            .with_ymd_and_hms(2022, 4, 3, 12, 30, 5)
            .single()
            .expect("literal timestamp must be valid")
    }

    #[rstest]
    fn legacy_filename_appends_timestamp_and_rdb_extension() {
        let mut filename = PathBuf::from("dump");
        extend_filename(fixed_now(), None, &mut filename);
        assert_that!(
            filename.to_string_lossy().as_ref(),
            eq("dump-2022-04-03T12:30:05.rdb")
        );
    }

    #[rstest]
    fn legacy_filename_with_extension_is_left_untouched() {
        let mut filename = PathBuf::from("backup.rdb");
        extend_filename(fixed_now(), None, &mut filename);
        assert_that!(filename.to_string_lossy().as_ref(), eq("backup.rdb"));
    }

    #[rstest]
    #[case(0, "dump-2022-04-03T12:30:05-0000.dfs")]
    #[case(3, "dump-2022-04-03T12:30:05-0003.dfs")]
    #[case(1234, "dump-2022-04-03T12:30:05-1234.dfs")]
    fn shard_filename_pads_shard_id_to_four_digits(#[case] shard: u16, #[case] expected: &str) {
        let mut filename = PathBuf::from("dump");
        extend_filename(fixed_now(), Some(shard), &mut filename);
        assert_that!(filename.to_string_lossy().as_ref(), eq(expected));
    }

    #[rstest]
    fn create_dirs_builds_missing_directories() {
        let root = tempfile::tempdir().expect("tempdir must create");
        let nested = root.path().join("a/b/c");
        create_dirs(&nested).expect("directories must create");
        assert_that!(nested.is_dir(), eq(true));
        create_dirs(&nested).expect("existing directory must pass");
    }

    #[rstest]
    fn infer_prefers_exact_match_then_latest_rdb() {
        let root = tempfile::tempdir().expect("tempdir must create");
        std::fs::write(root.path().join("dump-2022-01-01T00:00:00.rdb"), b"x")
            .expect("file must write");
        std::fs::write(root.path().join("dump-2022-02-01T00:00:00.rdb"), b"x")
            .expect("file must write");

        let inferred = infer_load_file(root.path(), "dump").expect("candidate must be found");
        let LoadSource::Single(path) = inferred else {
            panic!("expected single rdb candidate");
        };
        assert_that!(
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            eq(&Some("dump-2022-02-01T00:00:00.rdb".to_owned()))
        );

        std::fs::write(root.path().join("dump"), b"x").expect("file must write");
        let exact = infer_load_file(root.path(), "dump").expect("candidate must be found");
        assert_that!(&exact, eq(&LoadSource::Single(root.path().join("dump"))));
    }

    #[rstest]
    fn infer_groups_complete_dfs_sets_by_timestamp() {
        let root = tempfile::tempdir().expect("tempdir must create");
        for shard in 0..2 {
            std::fs::write(
                root.path()
                    .join(format!("dump-2022-01-01T00:00:00-{shard:04}.dfs")),
                b"x",
            )
            .expect("file must write");
            std::fs::write(
                root.path()
                    .join(format!("dump-2022-03-01T00:00:00-{shard:04}.dfs")),
                b"x",
            )
            .expect("file must write");
        }

        let inferred = infer_load_file(root.path(), "dump").expect("candidate must be found");
        let LoadSource::ShardSet(members) = inferred else {
            panic!("expected dfs shard set");
        };
        assert_that!(members.len(), eq(2_usize));
        for member in members {
            assert_that!(
                member.to_string_lossy().contains("2022-03-01T00:00:00"),
                eq(true)
            );
        }
    }

    #[rstest]
    fn infer_returns_none_for_missing_or_extended_names() {
        let root = tempfile::tempdir().expect("tempdir must create");
        assert_that!(infer_load_file(root.path(), "dump"), eq(&None));
        assert_that!(infer_load_file(root.path(), "dump.rdb"), eq(&None));
        assert_that!(infer_load_file(root.path(), ""), eq(&None));
    }
}
