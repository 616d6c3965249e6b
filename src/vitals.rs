//! Host vitals collection.
//!
//! The platform only constructs and exposes the [`VitalsService`]; callers
//! decide when to sample it.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::dirs::DirProvider;
use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Load averages as reported by the kernel.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LoadAverage {
    /// One-minute average.
    pub one: String,
    /// Five-minute average.
    pub five: String,
    /// Fifteen-minute average.
    pub fifteen: String,
}

/// Memory usage in kibibytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Total memory.
    pub total_kb: u64,
    /// Memory in use (total minus available).
    pub used_kb: u64,
}

/// Usage of a single filesystem in kibibytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DiskUsage {
    /// Filesystem size.
    pub total_kb: u64,
    /// Space in use.
    pub used_kb: u64,
}

/// Source of raw host statistics.
pub trait StatsCollector {
    /// Returns current load averages.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Read`] when the statistics are unavailable.
    fn load(&self) -> PlatformResult<LoadAverage>;

    /// Returns memory usage.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Read`] when the statistics are unavailable.
    fn memory(&self) -> PlatformResult<MemoryStats>;

    /// Returns usage of the filesystem holding `path`, or `None` when the
    /// path does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `df` fails.
    fn disk_usage(&self, path: &Utf8Path) -> PlatformResult<Option<DiskUsage>>;
}

/// [`StatsCollector`] reading `/proc` and running `df`.
#[derive(Clone, Debug)]
pub struct ProcStatsCollector<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
}

impl<R, F> ProcStatsCollector<R, F> {
    /// Creates a collector.
    #[must_use]
    pub const fn new(runner: R, fs: F, paths: HostPaths) -> Self {
        Self { runner, fs, paths }
    }
}

impl<R: CommandRunner, F: FileSystem> StatsCollector for ProcStatsCollector<R, F> {
    fn load(&self) -> PlatformResult<LoadAverage> {
        let contents = self
            .fs
            .read_to_string(&self.paths.resolve("/proc/loadavg"))
            .map_err(fs_error("read load average"))?;
        let mut fields = contents.split_whitespace().map(str::to_owned);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(one), Some(five), Some(fifteen)) => Ok(LoadAverage { one, five, fifteen }),
            _ => Err(PlatformError::Read {
                path: String::from("/proc/loadavg"),
                message: String::from("expected three load averages"),
            }),
        }
    }

    fn memory(&self) -> PlatformResult<MemoryStats> {
        let contents = self
            .fs
            .read_to_string(&self.paths.resolve("/proc/meminfo"))
            .map_err(fs_error("read memory info"))?;
        let total = meminfo_field(&contents, "MemTotal");
        let available = meminfo_field(&contents, "MemAvailable");
        match (total, available) {
            (Some(total_kb), Some(available_kb)) => Ok(MemoryStats {
                total_kb,
                used_kb: total_kb.saturating_sub(available_kb),
            }),
            _ => Err(PlatformError::Read {
                path: String::from("/proc/meminfo"),
                message: String::from("missing MemTotal or MemAvailable"),
            }),
        }
    }

    fn disk_usage(&self, path: &Utf8Path) -> PlatformResult<Option<DiskUsage>> {
        if !self
            .fs
            .exists(&self.paths.resolve(path))
            .map_err(fs_error("inspect disk path"))?
        {
            return Ok(None);
        }
        let output = self
            .runner
            .run("df", &args(["-Pk", path.as_str()]))
            .map_err(runner_error("disk usage", path.as_str()))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed(
                "disk usage",
                path.as_str(),
                "df",
                &output,
            ));
        }
        Ok(parse_df(&output.stdout))
    }
}

fn meminfo_field(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

fn parse_df(stdout: &str) -> Option<DiskUsage> {
    let line = stdout.lines().nth(1)?;
    let mut fields = line.split_whitespace().skip(1);
    let total_kb = fields.next()?.parse().ok()?;
    let used_kb = fields.next()?.parse().ok()?;
    Some(DiskUsage { total_kb, used_kb })
}

/// Percentage usage of one filesystem, rendered as a whole number.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DiskVitals {
    /// Percentage of space used.
    pub percent: String,
}

impl From<DiskUsage> for DiskVitals {
    fn from(usage: DiskUsage) -> Self {
        Self {
            percent: percent(usage.used_kb, usage.total_kb),
        }
    }
}

/// Snapshot of host vitals.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Vitals {
    /// Load averages.
    pub load: LoadAverage,
    /// Memory usage in kibibytes and percent.
    pub mem: MemoryVitals,
    /// Root filesystem usage.
    pub system: Option<DiskVitals>,
    /// Ephemeral data disk usage.
    pub ephemeral: Option<DiskVitals>,
    /// Persistent store usage.
    pub persistent: Option<DiskVitals>,
}

/// Memory section of [`Vitals`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MemoryVitals {
    /// Used memory in kibibytes.
    pub kb: String,
    /// Percentage of memory in use.
    pub percent: String,
}

fn percent(used: u64, total: u64) -> String {
    used.saturating_mul(100)
        .checked_div(total)
        .unwrap_or_default()
        .to_string()
}

/// Builds [`Vitals`] snapshots from a [`StatsCollector`].
pub struct VitalsService {
    collector: Box<dyn StatsCollector>,
    dirs: DirProvider,
}

impl std::fmt::Debug for VitalsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VitalsService")
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

impl VitalsService {
    /// Creates a service sampling `collector`.
    #[must_use]
    pub fn new(collector: Box<dyn StatsCollector>, dirs: DirProvider) -> Self {
        Self { collector, dirs }
    }

    /// Collects a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns the collector's error when load or memory cannot be read.
    pub fn get(&self) -> PlatformResult<Vitals> {
        let load = self.collector.load()?;
        let memory = self.collector.memory()?;
        let ephemeral: Utf8PathBuf = self.dirs.data_dir();
        let persistent: Utf8PathBuf = self.dirs.store_dir();
        Ok(Vitals {
            load,
            mem: MemoryVitals {
                kb: memory.used_kb.to_string(),
                percent: percent(memory.used_kb, memory.total_kb),
            },
            system: self.collector.disk_usage(Utf8Path::new("/"))?.map(DiskVitals::from),
            ephemeral: self.collector.disk_usage(&ephemeral)?.map(DiskVitals::from),
            persistent: self.collector.disk_usage(&persistent)?.map(DiskVitals::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFileSystem;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    #[rstest]
    #[case(50, 200, "25")]
    #[case(0, 0, "0")]
    #[case(3, 3, "100")]
    fn percent_rounds_down(#[case] used: u64, #[case] total: u64, #[case] expected: &str) {
        assert_eq!(percent(used, total), expected);
    }

    #[test]
    fn parse_df_reads_second_line() {
        let stdout = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                      /dev/sda1 1000 250 750 25% /\n";
        assert_eq!(
            parse_df(stdout),
            Some(DiskUsage {
                total_kb: 1000,
                used_kb: 250
            })
        );
    }

    #[test]
    fn service_collects_load_memory_and_root_usage() {
        let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        HostFileSystem
            .write(&root.join("proc/loadavg"), b"0.10 0.20 0.30 1/100 42\n")
            .unwrap_or_else(|err| panic!("seed: {err}"));
        HostFileSystem
            .write(
                &root.join("proc/meminfo"),
                b"MemTotal:  1000 kB\nMemFree: 100 kB\nMemAvailable:  400 kB\n",
            )
            .unwrap_or_else(|err| panic!("seed: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "Filesystem 1024-blocks Used\n/dev/sda1 100 40 60 40% /\n", "");

        let collector = ProcStatsCollector::new(runner, HostFileSystem, HostPaths::new(root));
        let vitals = VitalsService::new(Box::new(collector), DirProvider::default())
            .get()
            .unwrap_or_else(|err| panic!("vitals: {err}"));

        assert_eq!(vitals.load.five, "0.20");
        assert_eq!(vitals.mem.kb, "600");
        assert_eq!(vitals.mem.percent, "60");
        assert_eq!(vitals.system.map(|disk| disk.percent), Some(String::from("40")));
        assert!(vitals.ephemeral.is_none());
    }
}
