use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::log::LogLevel::*;
use crate::registry::{RegionHandle, RegionRecord, Registry};

fn status_column(record: &RegionRecord) -> &'static str {
    if record.optimized_out {
        "compiler-optimized"
    } else if record.inactive {
        "deleted"
    } else if record.deletable {
        "deletable"
    } else {
        ""
    }
}

/// Emits a fixed-width table with columns: region name, region id, call
/// count, total duration, mean duration, and lifecycle status (§4.7).
pub fn write_table<W: Write>(registry: &Registry, out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "{:<40} {:>10} {:>12} {:>16} {:>14}  {}",
        "region", "id", "calls", "duration", "mean", "status"
    )?;

    let mut rows: Vec<(RegionHandle, RegionRecord)> = Vec::new();
    registry.for_each_region(|id, record| rows.push((id, record.clone())));
    rows.sort_by_key(|(id, _)| *id);

    for (id, record) in &rows {
        writeln!(
            out,
            "{:<40} {:>10} {:>12} {:>16} {:>14}  {}",
            record.region_name,
            id,
            record.call_count,
            record.duration_total,
            record.mean_duration,
            status_column(record)
        )?;
    }
    Ok(())
}

/// Writes the list of region names that are `inactive` or
/// `optimized_out` to `<experiment_dir>/df-filter.list.<pid>`, renaming
/// any pre-existing file with a `.old` suffix first (§4.7).
pub fn write_filter_file(registry: &Registry, experiment_dir: &Path, pid: u32) -> io::Result<PathBuf> {
    let path = experiment_dir.join(format!("df-filter.list.{}", pid));
    if path.exists() {
        let backup = path.with_extension("old");
        if let Err(e) = fs::rename(&path, &backup) {
            log!(LogWarn, "could not back up previous filter file {}: {}", path.display(), e);
        }
    }

    let mut names = Vec::new();
    registry.for_each_region(|_, record| {
        if record.inactive || record.optimized_out {
            names.push(record.region_name.clone());
        }
    });
    names.sort();

    let mut file = fs::File::create(&path)?;
    for name in names {
        writeln!(file, "{}", name)?;
    }
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_lists_every_region_with_its_status() {
        let registry = Registry::new();
        registry.define(1, "hot");
        registry.with_region(1, |r| {
            r.call_count = 3;
            r.duration_total = 30;
            r.mean_duration = 10;
            r.inactive = true;
            r.deletable = true;
        });
        registry.define(2, "cold");
        registry.with_region(2, |r| {
            r.call_count = 2;
            r.duration_total = 2_000_000;
            r.mean_duration = 1_000_000;
        });

        let mut out = Vec::new();
        write_table(&registry, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("hot"));
        assert!(text.contains("deleted"));
        assert!(text.contains("cold"));
    }

    #[test]
    fn filter_file_lists_inactive_and_optimized_regions_and_backs_up_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new();
        registry.define(1, "patched_out");
        registry.with_region(1, |r| r.inactive = true);
        registry.define(2, "tail_called");
        registry.with_region(2, |r| r.optimized_out = true);
        registry.define(3, "still_live");

        let path = write_filter_file(&registry, dir.path(), 4242).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("patched_out"));
        assert!(contents.contains("tail_called"));
        assert!(!contents.contains("still_live"));

        // Writing again should preserve the previous file under .old.
        write_filter_file(&registry, dir.path(), 4242).unwrap();
        let backup = path.with_extension("old");
        assert!(backup.exists());
    }
}
