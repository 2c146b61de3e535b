// Jobs persisted by one process are fired by the next one.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use smarties_db::DbManager;
use smarties_scheduler::{CallbackRegistry, JobState, Relative, Scheduler, When};

fn open(path: &std::path::Path) -> Scheduler {
    let db = Arc::new(DbManager::open(path).unwrap());
    Scheduler::new(db, Arc::new(CallbackRegistry::new()), "0.0.0").unwrap()
}

#[test]
fn overdue_job_fires_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.db");

    let past = Utc::now() - Duration::minutes(10);
    {
        let scheduler = open(&path);
        scheduler
            .schedule("heater", When::at(past), &serde_json::json!({"target": 19}))
            .unwrap();
        scheduler
            .schedule("blinds", When::relative(Relative::ADay), &"close")
            .unwrap();
    }

    let scheduler = open(&path);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    scheduler.register("heater", move |payload| {
        sink.lock().unwrap().push(payload);
        Ok(())
    });

    let report = scheduler.sweep().unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!({"target": 19})]);
    assert_eq!(scheduler.pending("blinds").unwrap().len(), 1);
}

#[test]
fn terminal_rows_are_not_fired_again_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hub.db");

    {
        let scheduler = open(&path);
        scheduler.register("door", |_| Ok(()));
        scheduler.schedule("door", When::timestamp(0), &()).unwrap();
        scheduler.schedule("alarm", When::timestamp(0), &()).unwrap();
        scheduler.cancel("alarm").unwrap();
        assert_eq!(scheduler.sweep().unwrap().fired, 1);
    }

    let scheduler = open(&path);
    let hits = Arc::new(Mutex::new(0));
    for key in ["door", "alarm"] {
        let hits = Arc::clone(&hits);
        scheduler.register(key, move |_| {
            *hits.lock().unwrap() += 1;
            Ok(())
        });
    }
    assert_eq!(scheduler.sweep().unwrap().total(), 0);
    assert_eq!(*hits.lock().unwrap(), 0);

    let states: Vec<JobState> = scheduler
        .jobs(None)
        .unwrap()
        .into_iter()
        .map(|job| job.state)
        .collect();
    assert_eq!(states, vec![JobState::Fired, JobState::Cancelled]);
}
