/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Contents of `suite.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteMeta {
    pub name: String,
    pub created_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
}

/// Root directory under which every suite run gets its own timestamped directory.
#[derive(Debug, Clone)]
pub struct SuiteDirectory {
    root: PathBuf,
}

impl SuiteDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn allocate(&self, name: &str) -> anyhow::Result<SuiteRun> {
        self.allocate_at(name, Local::now())
    }

    /// Creates `<root>/<name>_<YYYYmmdd_HHMMSS>`. When that directory already exists, `_1`, `_2`
    /// and so on are appended until a free name is found.
    pub fn allocate_at(&self, name: &str, now: DateTime<Local>) -> anyhow::Result<SuiteRun> {
        fs::create_dir_all(&self.root)
            .context(format!("Unable to create suite root {}", self.root.display()))?;

        let stem = format!("{}_{}", name, now.format("%Y%m%d_%H%M%S"));
        let mut attempt = 0;
        let path = loop {
            let candidate = match attempt {
                0 => self.root.join(&stem),
                n => self.root.join(format!("{}_{}", stem, n)),
            };
            // create_dir fails on an existing directory
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => {
                    return Err(err)
                        .context(format!("Unable to create suite directory {}", candidate.display()))
                }
            }
        };
        fs::create_dir(path.join("trials"))?;

        let run = SuiteRun {
            path,
            meta: SuiteMeta {
                name: name.to_string(),
                created_at: now,
                finished_at: None,
            },
            used: HashSet::new(),
        };
        run.write_meta()?;
        debug!("allocated suite directory {}", run.path.display());
        Ok(run)
    }

    /// Reopens an unfinished run so that it can be resumed. A finished run is read-only.
    pub fn reopen(path: &Path) -> anyhow::Result<SuiteRun> {
        let meta_path = path.join("suite.json");
        let meta: SuiteMeta = serde_json::from_slice(
            &fs::read(&meta_path).context(format!("Unable to read {}", meta_path.display()))?,
        )
        .context(format!("{} is not a valid suite record", meta_path.display()))?;

        if let Some(finished_at) = meta.finished_at {
            return Err(anyhow!(
                "Suite run {} finished at {} and cannot be reopened",
                path.display(),
                finished_at
            ));
        }

        let mut used = HashSet::new();
        let trials = path.join("trials");
        fs::create_dir_all(&trials)?;
        for entry in fs::read_dir(&trials)? {
            used.insert(entry?.file_name().to_string_lossy().to_string());
        }

        Ok(SuiteRun {
            path: path.to_path_buf(),
            meta,
            used,
        })
    }
}

/// One suite run. Hands out trial directories and is consumed once the run is finished.
#[derive(Debug)]
pub struct SuiteRun {
    path: PathBuf,
    meta: SuiteMeta,
    used: HashSet<String>,
}

/// A trial's private directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialDir {
    pub index: usize,
    pub attempt: usize,
    pub path: PathBuf,
}

impl TrialDir {
    pub fn join(&self, file: &str) -> PathBuf {
        self.path.join(file)
    }
}

impl SuiteRun {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_meta(&self) -> anyhow::Result<()> {
        fs::write(
            self.path.join("suite.json"),
            serde_json::to_vec_pretty(&self.meta)?,
        )
        .context(format!("Unable to write suite record in {}", self.path.display()))
    }

    /// Directory name of the given attempt of a trial.
    pub fn trial_dir_name(index: usize, attempt: usize) -> String {
        match attempt {
            0 => format!("{:04}", index),
            n => format!("{:04}_{}", index, n),
        }
    }

    /// Path of an earlier attempt's directory, whether or not it exists.
    pub fn trial_path(&self, index: usize, attempt: usize) -> PathBuf {
        self.path
            .join("trials")
            .join(Self::trial_dir_name(index, attempt))
    }

    /// Attempts of a trial that already have a directory, oldest first.
    pub fn attempts(&self, index: usize) -> Vec<TrialDir> {
        let mut attempts = vec![];
        let mut attempt = 0;
        while self.used.contains(&Self::trial_dir_name(index, attempt)) {
            attempts.push(TrialDir {
                index,
                attempt,
                path: self.trial_path(index, attempt),
            });
            attempt += 1;
        }
        attempts
    }

    /// Creates a fresh, empty directory for the next attempt of trial `index`. A directory is
    /// never handed out twice within a run.
    pub fn allocate_trial(&mut self, index: usize) -> anyhow::Result<TrialDir> {
        let mut attempt = 0;
        while self.used.contains(&Self::trial_dir_name(index, attempt)) {
            attempt += 1;
        }

        let name = Self::trial_dir_name(index, attempt);
        let path = self.trial_path(index, attempt);
        fs::create_dir(&path).context(format!("Unable to create trial directory {}", path.display()))?;
        self.used.insert(name);

        Ok(TrialDir {
            index,
            attempt,
            path,
        })
    }

    /// Stamps the run as finished. It cannot be reopened afterwards.
    pub fn finish(mut self) -> anyhow::Result<PathBuf> {
        self.meta.finished_at = Some(Local::now());
        self.write_meta()?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn colliding_names_get_a_suffix() -> anyhow::Result<()> {
        let scratch = tempfile::tempdir()?;
        let root = scratch.path().join("suites");
        let dir = SuiteDirectory::new(&root);
        let now = Local
            .with_ymd_and_hms(2024, 5, 17, 13, 4, 5)
            .single()
            .expect("unambiguous time");

        let a = dir.allocate_at("epaxos", now)?;
        let b = dir.allocate_at("epaxos", now)?;
        let c = dir.allocate_at("epaxos", now)?;

        assert_eq!(a.path(), root.join("epaxos_20240517_130405"));
        assert_eq!(b.path(), root.join("epaxos_20240517_130405_1"));
        assert_eq!(c.path(), root.join("epaxos_20240517_130405_2"));
        assert!(a.path().join("suite.json").exists());
        Ok(())
    }

    #[test]
    fn trial_directories_are_distinct_and_empty() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mut run = SuiteDirectory::new(root.path()).allocate("fmp")?;

        let dirs = (0..12)
            .map(|i| run.allocate_trial(i))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let unique = dirs.iter().map(|d| d.path.clone()).collect::<HashSet<_>>();
        assert_eq!(unique.len(), 12);
        for dir in dirs.iter() {
            assert_eq!(fs::read_dir(&dir.path)?.count(), 0);
        }
        assert_eq!(dirs[3].path.file_name().and_then(|n| n.to_str()), Some("0003"));

        let again = run.allocate_trial(3)?;
        assert_eq!(again.attempt, 1);
        assert_eq!(again.path.file_name().and_then(|n| n.to_str()), Some("0003_1"));
        assert_eq!(run.attempts(3).len(), 2);
        Ok(())
    }

    #[test]
    fn finished_runs_cannot_be_reopened() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let mut run = SuiteDirectory::new(root.path()).allocate("epaxos")?;
        run.allocate_trial(0)?;
        let path = run.path().to_path_buf();

        let mut reopened = SuiteDirectory::reopen(&path)?;
        assert_eq!(reopened.attempts(0).len(), 1);
        assert_eq!(reopened.allocate_trial(0)?.attempt, 1);

        let path = reopened.finish()?;
        assert!(SuiteDirectory::reopen(&path).is_err());
        Ok(())
    }
}
