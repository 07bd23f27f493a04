//! End-to-end engine scenarios: retention changes, restore, vanished
//! sources, memos and watcher-driven backups.

use std::fs;
use std::thread;
use std::time::Duration;

use savevault::core::publisher::Recorded;
use savevault::core::{Engine, EngineError, Outcome};
use savevault::infra::EnginePaths;

mod util;
use util::{Fixture, archived};

fn backup(
    engine: &Engine,
    category: &str,
) -> String
{
    match engine
        .request_backup(category)
        .wait()
        .unwrap()
    {
        Outcome::Created { id, .. } => id.to_string(),
        other => panic!("expected a new snapshot, got {other:?}"),
    }
}

#[test]
fn shrinking_retention_prunes_existing_snapshots()
{
    let fx = Fixture::new();
    let (engine, notifier) = fx.engine(10);

    let mut ids = Vec::new();
    for i in 0..5
    {
        fx.write("SaveB", "slot.dat", &format!("turn {i}"));
        fx.tick();
        ids.push(backup(&engine, "SaveB"));
    }
    assert_eq!(archived(&fx.data_dir(), "SaveB").len(), 5);

    let settings = engine
        .update_settings(&fx.saves_str(), 2, "system")
        .unwrap();
    assert_eq!(settings.max_generations, 2);
    assert_eq!(archived(&fx.data_dir(), "SaveB"), ids[3..].to_vec());

    let cats = notifier
        .last_categories()
        .unwrap();
    let b = cats
        .iter()
        .find(|c| c.name == "SaveB")
        .unwrap();
    assert_eq!(b.snapshots.len(), 2);
    assert_eq!(b.latest.as_deref(), Some(ids[4].as_str()));
}

#[test]
fn unknown_snapshot_restore_only_notifies()
{
    let fx = Fixture::new();
    let (engine, notifier) = fx.engine(10);
    fx.write("SaveC", "slot.dat", "live");
    backup(&engine, "SaveC");
    notifier.clear();

    let err = engine
        .request_restore("SaveC", "20990101_000000")
        .wait()
        .unwrap_err();
    assert!(matches!(*err, EngineError::NotFound { .. }));

    let recorded = notifier.all();
    assert_eq!(recorded.len(), 1, "{recorded:?}");
    let Recorded::Event(event) = &recorded[0]
    else
    {
        panic!("expected a notification, got {recorded:?}");
    };
    assert_eq!(event.title, "Restore failed");
    assert_eq!(fx.read("SaveC", "slot.dat"), "live");
}

#[test]
fn vanished_source_keeps_archive_listed()
{
    let fx = Fixture::new();
    let (engine, notifier) = fx.engine(10);
    fx.write("SaveD", "slot.dat", "x");
    backup(&engine, "SaveD");

    fs::remove_dir_all(
        fx.saves()
            .join("SaveD"),
    )
    .unwrap();
    notifier.clear();

    let err = engine
        .request_backup("SaveD")
        .wait()
        .unwrap_err();
    assert!(matches!(*err, EngineError::SourceMissing { .. }));
    assert!(notifier.events().is_empty());

    let cats = notifier
        .last_categories()
        .unwrap();
    let d = cats
        .iter()
        .find(|c| c.name == "SaveD")
        .unwrap();
    assert!(!d.source_exists);
    assert_eq!(d.snapshots.len(), 1);
}

#[test]
fn restore_replaces_live_folder()
{
    let fx = Fixture::new();
    let (engine, notifier) = fx.engine(10);
    fx.write("SaveA", "slot.dat", "chapter 1");
    let first = backup(&engine, "SaveA");

    fx.tick();
    fx.write("SaveA", "slot.dat", "chapter 2");
    fx.write("SaveA", "extra/new.dat", "only later");
    backup(&engine, "SaveA");

    let outcome = engine
        .request_restore("SaveA", &first)
        .wait()
        .unwrap();
    assert_eq!(outcome, Outcome::Restored);
    assert_eq!(fx.read("SaveA", "slot.dat"), "chapter 1");
    assert!(
        !fx.saves()
            .join("SaveA/extra")
            .exists()
    );
    assert!(
        notifier
            .events()
            .iter()
            .any(|e| e.title == "Restore complete")
    );

    // Nothing engine-owned is left next to the categories
    let leftovers: Vec<_> = fs::read_dir(fx.saves())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with(".svault-")
        })
        .collect();
    assert!(leftovers.is_empty());

    // A snapshot taken now matches the restored one
    fx.tick();
    let again = backup(&engine, "SaveA");
    let archive = fx
        .data_dir()
        .join("archive/SaveA");
    assert_eq!(
        fs::read_to_string(archive.join(&again).join("slot.dat")).unwrap(),
        fs::read_to_string(archive.join(&first).join("slot.dat")).unwrap()
    );
}

#[test]
fn memo_is_published_and_cleared()
{
    let fx = Fixture::new();
    let (engine, notifier) = fx.engine(10);
    fx.write("SaveA", "slot.dat", "x");

    let outcome = engine
        .set_memo("SaveA", "before the final boss")
        .wait()
        .unwrap();
    assert_eq!(outcome, Outcome::MemoSaved);
    let memo = |n: &savevault::core::publisher::RecordingNotifier| {
        n.last_categories()
            .unwrap()
            .into_iter()
            .find(|c| c.name == "SaveA")
            .unwrap()
            .memo
    };
    assert_eq!(memo(&notifier), "before the final boss");

    engine
        .set_memo("SaveA", "")
        .wait()
        .unwrap();
    assert_eq!(memo(&notifier), "");
}

#[test]
fn settings_are_clamped_and_persisted()
{
    let fx = Fixture::new();
    {
        let (engine, _) = fx.engine(500);
        assert_eq!(engine.settings().max_generations, 100);

        let s = engine
            .update_settings(&fx.saves_str(), -3, "dark")
            .unwrap();
        assert_eq!(s.max_generations, 1);
        assert_eq!(s.theme, "dark");
    }

    let reopened = Engine::builder(EnginePaths::new(fx.data_dir()))
        .open()
        .unwrap();
    let s = reopened.settings();
    assert_eq!(s.max_generations, 1);
    assert_eq!(s.theme, "dark");
    assert_eq!(s.repo_save_path, fx.saves_str());
}

#[test]
fn rapid_manual_requests_share_snapshots()
{
    let fx = Fixture::new();
    let (engine, _) = fx.engine(10);
    fx.write("SaveA", "slot.dat", "x");

    let tickets: Vec<_> = (0..4)
        .map(|_| engine.request_backup("SaveA"))
        .collect();
    for t in tickets
    {
        let outcome = t
            .wait()
            .unwrap();
        assert!(matches!(
            outcome,
            Outcome::Created { .. } | Outcome::Coalesced { .. }
        ));
    }

    // One runs, the rest are satisfied by it
    let snaps = archived(&fx.data_dir(), "SaveA");
    assert_eq!(snaps.len(), 1, "{snaps:?}");
}

#[test]
fn manual_and_auto_together_yield_one_snapshot()
{
    let fx = Fixture::new();
    fx.write("SaveA", "slot.dat", "start");
    let (engine, _) = fx.engine(10);
    engine
        .initialize()
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    fx.write("SaveA", "slot.dat", "checkpoint");
    let manual = engine.request_backup("SaveA");
    assert!(matches!(
        manual
            .wait()
            .unwrap(),
        Outcome::Created { .. } | Outcome::Coalesced { .. }
    ));

    // The watcher's intent for the same write settles afterwards
    thread::sleep(Duration::from_millis(800));
    engine.wait_idle();

    let snaps = archived(&fx.data_dir(), "SaveA");
    assert_eq!(snaps.len(), 1, "{snaps:?}");
}

/// Wait until `category` has `count` snapshots or `within` passes.
fn await_snapshots(
    fx: &Fixture,
    engine: &Engine,
    category: &str,
    count: usize,
    within: Duration,
) -> Vec<String>
{
    let until = std::time::Instant::now() + within;
    loop
    {
        engine.wait_idle();
        let snaps = archived(&fx.data_dir(), category);
        if snaps.len() >= count || std::time::Instant::now() >= until
        {
            return snaps;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(unix)]
#[test]
fn symlinked_root_created_after_start_gets_auto_backups()
{
    let fx = Fixture::new();
    let real = fx
        .tmp
        .path()
        .join("real");
    fs::create_dir(&real).unwrap();
    std::os::unix::fs::symlink(
        &real,
        fx.tmp
            .path()
            .join("link"),
    )
    .unwrap();
    let root = fx
        .tmp
        .path()
        .join("link/saves");

    let (engine, _) = fx.engine_at(&root.to_string_lossy(), 10);
    engine
        .initialize()
        .unwrap();

    // Root appears through the real path; backoff tops out at 200ms
    fs::create_dir_all(real.join("saves/SaveA")).unwrap();
    thread::sleep(Duration::from_millis(600));

    fs::write(root.join("SaveA/slot.dat"), "found it").unwrap();
    let snaps = await_snapshots(&fx, &engine, "SaveA", 1, Duration::from_secs(3));
    assert_eq!(snaps.len(), 1, "{snaps:?}");

    let archive = fx
        .data_dir()
        .join("archive/SaveA")
        .join(&snaps[0]);
    assert_eq!(
        fs::read_to_string(archive.join("slot.dat")).unwrap(),
        "found it"
    );
}

#[test]
fn switching_root_moves_auto_backups_to_new_folder()
{
    let fx = Fixture::new();
    let old_root = fx.saves();
    let new_root = fx
        .tmp
        .path()
        .join("other");
    fs::create_dir_all(old_root.join("OldGame")).unwrap();
    fs::create_dir_all(new_root.join("NewGame")).unwrap();

    let (engine, _) = fx.engine(10);
    engine
        .initialize()
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    engine
        .update_settings(&new_root.to_string_lossy(), 10, "system")
        .unwrap();
    assert_eq!(
        engine.watching(),
        Some(dunce::canonicalize(&new_root).unwrap())
    );
    thread::sleep(Duration::from_millis(200));

    fs::write(new_root.join("NewGame/slot.dat"), "new").unwrap();
    fs::write(old_root.join("OldGame/slot.dat"), "old").unwrap();
    let snaps = await_snapshots(&fx, &engine, "NewGame", 1, Duration::from_secs(3));
    // Leave time for anything from the old root to show up
    thread::sleep(Duration::from_millis(500));
    engine.wait_idle();

    assert_eq!(snaps.len(), 1, "{snaps:?}");
    assert_eq!(archived(&fx.data_dir(), "NewGame").len(), 1);
    assert!(archived(&fx.data_dir(), "OldGame").is_empty());
}

#[test]
fn burst_of_writes_yields_one_auto_snapshot()
{
    let fx = Fixture::new();
    fx.write("SaveA", "slot.dat", "start");
    let (engine, notifier) = fx.engine(10);
    engine
        .initialize()
        .unwrap();
    assert!(engine.watching().is_some());
    thread::sleep(Duration::from_millis(200));

    for i in 0..10
    {
        fx.write("SaveA", "slot.dat", &format!("frame {i}"));
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(1000));
    engine.wait_idle();

    let snaps = archived(&fx.data_dir(), "SaveA");
    assert_eq!(snaps.len(), 1, "{snaps:?}");
    assert!(
        notifier
            .events()
            .iter()
            .any(|e| e.title == "Backup created" && e.message.contains("auto"))
    );
    let archive = fx
        .data_dir()
        .join("archive/SaveA")
        .join(&snaps[0]);
    assert_eq!(
        fs::read_to_string(archive.join("slot.dat")).unwrap(),
        "frame 9"
    );
}
