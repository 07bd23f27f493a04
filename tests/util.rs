//! Shared test utilities for integration tests
//!
//! Builds a throwaway data directory plus a save folder with a few
//! categories, and opens an engine on it with a recording notifier and a
//! manual clock.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_fs::prelude::*;
use chrono::{Local, TimeDelta, TimeZone};
use savevault::core::{Engine, ManualClock, RecordingNotifier};
use savevault::infra::{EngineConfig, EnginePaths};

/// A save folder plus data directory under one temp dir.
pub struct Fixture
{
    pub tmp: assert_fs::TempDir,
    pub clock: Arc<ManualClock>,
}

impl Fixture
{
    pub fn new() -> Self
    {
        let tmp = assert_fs::TempDir::new().expect("tempdir");
        tmp.child("saves")
            .create_dir_all()
            .expect("saves dir");
        let start = Local
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .unwrap();
        Self {
            tmp,
            clock: Arc::new(ManualClock::new(start)),
        }
    }

    pub fn data_dir(&self) -> PathBuf
    {
        self.tmp
            .path()
            .join("data")
    }

    pub fn saves(&self) -> PathBuf
    {
        self.tmp
            .path()
            .join("saves")
    }

    pub fn saves_str(&self) -> String
    {
        self.saves()
            .to_string_lossy()
            .into_owned()
    }

    /// Write `body` to `category/rel` in the save folder.
    pub fn write(
        &self,
        category: &str,
        rel: &str,
        body: &str,
    )
    {
        let p = self
            .saves()
            .join(category)
            .join(rel);
        if let Some(parent) = p.parent()
        {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(p, body).unwrap();
    }

    pub fn read(
        &self,
        category: &str,
        rel: &str,
    ) -> String
    {
        fs::read_to_string(
            self.saves()
                .join(category)
                .join(rel),
        )
        .unwrap()
    }

    /// Move the clock forward so the next snapshot gets a fresh second.
    pub fn tick(&self)
    {
        self.clock
            .advance(TimeDelta::seconds(1));
    }

    /// Open an engine with a short debounce, pointed at the save folder.
    pub fn engine(
        &self,
        max_generations: i64,
    ) -> (Engine, Arc<RecordingNotifier>)
    {
        self.engine_at(&self.saves_str(), max_generations)
    }

    /// Same as [`Fixture::engine`] but watching `root`.
    pub fn engine_at(
        &self,
        root: &str,
        max_generations: i64,
    ) -> (Engine, Arc<RecordingNotifier>)
    {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = EngineConfig {
            debounce_ms: 150,
            restore_quiet_ms: 150,
            backoff_initial_ms: 50,
            backoff_max_ms: 200,
            parallel_copy: false,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(EnginePaths::new(self.data_dir()))
            .with_config(config)
            .with_notifier(notifier.clone())
            .with_clock(self.clock.clone())
            .open()
            .expect("open engine");
        engine
            .update_settings(root, max_generations, "system")
            .expect("settings");
        (engine, notifier)
    }
}

/// Snapshot directory names in the archive for `category`, oldest first.
pub fn archived(
    data_dir: &Path,
    category: &str,
) -> Vec<String>
{
    let dir = data_dir
        .join("archive")
        .join(category);
    let mut names: Vec<String> = match fs::read_dir(dir)
    {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}
