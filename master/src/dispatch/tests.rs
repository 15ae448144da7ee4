use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{Block, ErrorPolicy, Job, JobState, ReportAck, TaskOutcome, TaskRef, TaskReport, TaskState};

use super::DispatchEngine;
use crate::error::DispatchError;

fn policy(avoid_host: bool, retries: u32, task_same_host: bool) -> ErrorPolicy {
    ErrorPolicy {
        avoid_host,
        retries,
        task_same_host,
        forgive_time_secs: 60,
    }
}

fn render_job(name: &str, frames: i64, policy: ErrorPolicy) -> Job {
    let mut job = Job::new(name);
    job.add_block(
        Block::new("render", "maya")
            .with_command("mayarender -s @#@ -e @#@ scene.ma")
            .with_numeric(1, frames, 1, 1)
            .with_error_policy(policy),
    );
    job
}

fn engine_with_nodes(nodes: &[&str]) -> DispatchEngine {
    let engine = DispatchEngine::new();
    for node in nodes {
        engine.node_up(node);
    }
    engine
}

fn submit(engine: &DispatchEngine, job: Job, now: Instant) -> String {
    engine.submit(job, now).unwrap().id.unwrap()
}

fn report(task: &TaskRef, node: &str, outcome: TaskOutcome) -> TaskReport {
    TaskReport {
        task: task.clone(),
        node: node.to_string(),
        outcome,
        timestamp: Utc::now(),
        message: None,
    }
}

#[test]
fn submit_rejects_invalid_job() {
    let engine = DispatchEngine::new();
    let err = engine.submit(Job::new("vacio"), Instant::now()).unwrap_err();
    assert!(matches!(err, DispatchError::Validation(_)));
    assert!(engine.jobs().is_empty());
}

#[test]
fn submit_resolves_default_time_life() {
    let engine = DispatchEngine::new();
    let resp = engine
        .submit(render_job("ttl", 4, ErrorPolicy::default()), Instant::now())
        .unwrap();
    assert!(resp.accepted);
    assert_eq!(resp.resolved["time_life_secs"], 864_000);
    assert_eq!(resp.resolved["tasks"], 4);

    let info = engine.job_info(resp.id.as_deref().unwrap()).unwrap();
    assert_eq!(info.state, JobState::Pending);
    assert_eq!(info.tasks.total, 4);
}

#[test]
fn oldest_pending_task_goes_first() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let first = submit(&engine, render_job("primero", 2, policy(false, 3, true)), t0);
    let second = submit(&engine, render_job("segundo", 2, policy(false, 3, true)), t0);

    let a1 = engine.next_task("a", t0).unwrap();
    let a2 = engine.next_task("a", t0).unwrap();
    let a3 = engine.next_task("a", t0).unwrap();
    assert_eq!((a1.task.job_id.as_str(), a1.task.task), (first.as_str(), 0));
    assert_eq!((a2.task.job_id.as_str(), a2.task.task), (first.as_str(), 1));
    assert_eq!(a3.task.job_id, second);

    // una tarea reencolada vuelve al final de la fila
    let ack = engine.report(&report(&a1.task, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(ack, ReportAck::Requeued);
    let a4 = engine.next_task("a", t0).unwrap();
    assert_eq!((a4.task.job_id.as_str(), a4.task.task), (second.as_str(), 1));
    let a5 = engine.next_task("a", t0).unwrap();
    assert_eq!(a5.task, a1.task);
}

#[test]
fn assignment_carries_filled_command() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    submit(&engine, render_job("cmd", 3, ErrorPolicy::default()), t0);

    let a = engine.next_task("a", t0).unwrap();
    assert_eq!(a.command, "mayarender -s 1 -e 1 scene.ma");
    assert_eq!(a.service, "maya");
    assert_eq!(a.block_name, "render");
    assert_eq!(a.name, "0000");
}

#[test]
fn a_task_is_never_handed_out_twice() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    submit(&engine, render_job("uno", 1, ErrorPolicy::default()), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    assert!(engine.next_task("b", t0).is_none());
    assert_eq!(engine.task_state(&task).unwrap(), TaskState::Assigned);
}

#[test]
fn concurrent_requests_get_distinct_tasks() {
    let engine = DispatchEngine::new();
    let t0 = Instant::now();
    submit(&engine, render_job("muchas", 200, ErrorPolicy::default()), t0);

    let assigned = Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for n in 0..8 {
            let engine = &engine;
            let assigned = &assigned;
            s.spawn(move || {
                let node = format!("node{n}");
                while let Some(a) = engine.next_task(&node, t0) {
                    assigned.lock().unwrap().push(a.task);
                }
            });
        }
    });

    let assigned = assigned.into_inner().unwrap();
    let unique: HashSet<_> = assigned.iter().cloned().collect();
    assert_eq!(assigned.len(), 200);
    assert_eq!(unique.len(), 200);
}

#[test]
fn host_masks_restrict_nodes() {
    let engine = engine_with_nodes(&["ws101", "lnx01", "lnx02"]);
    let t0 = Instant::now();
    submit(
        &engine,
        render_job("linux", 2, ErrorPolicy::default())
            .with_hosts_mask("lnx.*")
            .with_hosts_mask_exclude("lnx02"),
        t0,
    );

    assert!(engine.next_task("ws101", t0).is_none());
    assert!(engine.next_task("lnx02", t0).is_none());
    assert!(engine.next_task("lnx01", t0).is_some());
}

#[test]
fn block_mask_overrides_job_mask() {
    let engine = engine_with_nodes(&["ws101", "lnx01"]);
    let t0 = Instant::now();
    let mut job = Job::new("override").with_hosts_mask("ws.*");
    job.add_block(
        Block::new("solo_linux", "maya")
            .with_command("echo @#@")
            .with_numeric(1, 1, 1, 1)
            .with_hosts_mask("lnx.*"),
    );
    submit(&engine, job, t0);

    assert!(engine.next_task("ws101", t0).is_none());
    assert!(engine.next_task("lnx01", t0).is_some());
}

#[test]
fn failed_task_avoids_same_host_when_alternative_exists() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    submit(&engine, render_job("mismo host", 1, policy(false, 3, false)), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();

    assert!(engine.next_task("a", t0).is_none());
    let retry = engine.next_task("b", t0).unwrap();
    assert_eq!(retry.task, task);
    assert_eq!(retry.errors, 1);
}

#[test]
fn failed_task_may_return_to_same_host_when_allowed() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    submit(&engine, render_job("mismo host", 1, policy(false, 3, true)), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();

    assert_eq!(engine.next_task("a", t0).unwrap().task, task);
}

#[test]
fn same_host_retry_is_allowed_when_no_other_node_can_run_it() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    submit(
        &engine,
        render_job("solo a", 1, policy(false, 3, false)).with_hosts_mask("a"),
        t0,
    );

    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(engine.next_task("a", t0).unwrap().task, task);

    // un nodo caído no cuenta como alternativa
    let engine = engine_with_nodes(&["a", "b"]);
    submit(&engine, render_job("b caido", 1, policy(false, 3, false)), t0);
    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();
    engine.release_node("b");
    assert_eq!(engine.next_task("a", t0).unwrap().task, task);
}

#[test]
fn erroring_host_is_avoided_for_the_block_until_forgiven() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    let id = submit(&engine, render_job("evitar", 3, policy(true, 5, true)), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(engine.host_errors("a", &id, 0, t0), 1);

    // "a" no recibe nada de este bloque mientras dure la ventana
    assert!(engine.next_task("a", t0 + Duration::from_secs(30)).is_none());
    assert!(engine.next_task("b", t0 + Duration::from_secs(30)).is_some());

    // pasado el forgive time vuelve a ser elegible
    let later = t0 + Duration::from_secs(61);
    assert_eq!(engine.host_errors("a", &id, 0, later), 0);
    assert!(engine.next_task("a", later).is_some());
}

#[test]
fn avoided_host_stays_eligible_for_other_blocks() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let mut job = Job::new("dos bloques");
    job.add_block(
        Block::new("falla", "maya")
            .with_numeric(1, 2, 1, 1)
            .with_error_policy(policy(true, 5, true)),
    )
    .add_block(
        Block::new("sano", "maya")
            .with_numeric(1, 1, 1, 1)
            .with_error_policy(policy(true, 5, true)),
    );
    submit(&engine, job, t0);

    let task = engine.next_task("a", t0).unwrap().task;
    assert_eq!(task.block, 0);
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();

    let next = engine.next_task("a", t0).unwrap();
    assert_eq!(next.task.block, 1);
    assert!(engine.next_task("a", t0).is_none());
}

#[test]
fn task_dies_after_exhausting_retries() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let id = submit(&engine, render_job("reintentos", 1, policy(false, 2, true)), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    let ack = engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(ack, ReportAck::Requeued);
    assert_eq!(engine.task_state(&task).unwrap(), TaskState::Pending);

    let again = engine.next_task("a", t0).unwrap().task;
    let ack = engine.report(&report(&again, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(ack, ReportAck::Dead);
    assert_eq!(engine.task_state(&task).unwrap(), TaskState::Dead);
    assert!(engine.next_task("a", t0).is_none());

    let info = engine.job_info(&id).unwrap();
    assert_eq!(info.state, JobState::Dead);
    assert_eq!(info.errors, 2);
    assert!(info.finished_at.is_some());
}

#[test]
fn zero_retries_dies_on_first_error() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    submit(&engine, render_job("sin reintentos", 1, policy(false, 0, true)), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    let ack = engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(ack, ReportAck::Dead);
}

#[test]
fn expired_job_kills_every_open_task() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let id = submit(
        &engine,
        render_job("corto", 4, policy(false, 10, true)).with_time_life_secs(10),
        t0,
    );

    let running = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&running, "a", TaskOutcome::Running), t0).unwrap();

    assert!(engine.expire_jobs(t0 + Duration::from_secs(10)).is_empty());
    let expired = engine.expire_jobs(t0 + Duration::from_secs(11));
    assert_eq!(expired, vec![id.clone()]);

    let info = engine.job_info(&id).unwrap();
    assert_eq!(info.state, JobState::Dead);
    assert_eq!(info.tasks.dead, 4);
    assert!(engine.next_task("a", t0 + Duration::from_secs(12)).is_none());

    // el resultado de lo que seguía corriendo se descarta
    let ack = engine
        .report(&report(&running, "a", TaskOutcome::Done), t0 + Duration::from_secs(12))
        .unwrap();
    assert_eq!(ack, ReportAck::Discarded);
    assert_eq!(engine.task_state(&running).unwrap(), TaskState::Dead);
}

#[test]
fn next_task_checks_lifetime_before_assigning() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let id = submit(
        &engine,
        render_job("vencido", 1, ErrorPolicy::default()).with_time_life_secs(5),
        t0,
    );
    assert!(engine.next_task("a", t0 + Duration::from_secs(6)).is_none());
    assert_eq!(engine.job_info(&id).unwrap().state, JobState::Dead);
}

#[test]
fn paused_job_is_not_dispatched() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let id = submit(&engine, render_job("pausado", 1, ErrorPolicy::default()).with_paused(true), t0);

    assert!(engine.next_task("a", t0).is_none());
    assert!(!engine.resume(&id).unwrap().paused);
    let task = engine.next_task("a", t0).unwrap().task;

    // pausar no interrumpe lo que ya corre
    engine.pause(&id).unwrap();
    let ack = engine.report(&report(&task, "a", TaskOutcome::Done), t0).unwrap();
    assert_eq!(ack, ReportAck::Accepted);
    assert_eq!(engine.job_info(&id).unwrap().state, JobState::Done);
}

#[test]
fn dependency_mask_waits_for_matching_jobs() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let first = submit(&engine, render_job("sim_layer", 1, ErrorPolicy::default()), t0);
    let second = submit(
        &engine,
        render_job("comp", 1, ErrorPolicy::default()).with_depend_mask_global("sim_.*"),
        t0,
    );

    let task = engine.next_task("a", t0).unwrap().task;
    assert_eq!(task.job_id, first);
    assert!(engine.next_task("a", t0).is_none());

    engine.report(&report(&task, "a", TaskOutcome::Done), t0).unwrap();
    let next = engine.next_task("a", t0).unwrap();
    assert_eq!(next.task.job_id, second);
}

#[test]
fn dead_dependency_also_releases_the_gate() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    submit(&engine, render_job("sim", 1, policy(false, 0, true)), t0);
    let comp = submit(
        &engine,
        render_job("comp", 1, ErrorPolicy::default()).with_depend_mask_global("sim"),
        t0,
    );

    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Error), t0).unwrap();
    assert_eq!(engine.next_task("a", t0).unwrap().task.job_id, comp);
}

#[test]
fn reports_from_the_wrong_node_are_stale() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    submit(&engine, render_job("stale", 1, ErrorPolicy::default()), t0);
    let task = engine.next_task("a", t0).unwrap().task;

    let ack = engine.report(&report(&task, "b", TaskOutcome::Done), t0).unwrap();
    assert_eq!(ack, ReportAck::Stale);
    assert_eq!(engine.task_state(&task).unwrap(), TaskState::Assigned);

    let missing = TaskRef {
        job_id: task.job_id.clone(),
        block: 0,
        task: 99,
    };
    assert!(matches!(
        engine.report(&report(&missing, "a", TaskOutcome::Done), t0),
        Err(DispatchError::TaskNotFound(_))
    ));
}

#[test]
fn released_node_returns_tasks_without_charging_errors() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    let id = submit(&engine, render_job("perdido", 2, policy(true, 1, false)), t0);

    let task = engine.next_task("a", t0).unwrap().task;
    assert_eq!(engine.release_node("a"), 1);
    assert_eq!(engine.task_state(&task).unwrap(), TaskState::Pending);
    assert_eq!(engine.host_errors("a", &id, 0, t0), 0);
    assert_eq!(engine.job_info(&id).unwrap().errors, 0);
}

#[test]
fn released_task_goes_back_to_the_queue_only_from_its_node() {
    let engine = engine_with_nodes(&["a", "b"]);
    let t0 = Instant::now();
    let id = submit(&engine, render_job("suelta", 2, ErrorPolicy::default()), t0);

    let first = engine.next_task("a", t0).unwrap().task;
    let second = engine.next_task("a", t0).unwrap().task;

    assert!(!engine.release_task(&first, "b"));
    assert!(engine.release_task(&first, "a"));
    assert!(!engine.release_task(&first, "a"));

    assert_eq!(engine.task_state(&first).unwrap(), TaskState::Pending);
    assert_eq!(engine.task_state(&second).unwrap(), TaskState::Assigned);
    assert_eq!(engine.job_info(&id).unwrap().errors, 0);
    assert_eq!(engine.next_task("b", t0).unwrap().task, first);
}

#[test]
fn concurrent_failures_on_same_node_and_block_are_all_counted() {
    const TASKS: usize = 64;
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let id = submit(
        &engine,
        render_job("estres", TASKS as i64, policy(false, 10, true)),
        t0,
    );

    let tasks: Vec<TaskRef> = (0..TASKS)
        .map(|_| engine.next_task("a", t0).unwrap().task)
        .collect();

    std::thread::scope(|s| {
        for task in &tasks {
            let engine = &engine;
            s.spawn(move || {
                let ack = engine.report(&report(task, "a", TaskOutcome::Error), t0).unwrap();
                assert_eq!(ack, ReportAck::Requeued);
            });
        }
    });

    assert_eq!(engine.host_errors("a", &id, 0, t0), TASKS as u32);
    assert_eq!(engine.job_info(&id).unwrap().errors, TASKS as u32);
}

#[test]
fn finished_jobs_are_purged_after_retention() {
    let engine = engine_with_nodes(&["a"]);
    let t0 = Instant::now();
    let id = submit(&engine, render_job("purga", 1, ErrorPolicy::default()), t0);
    let task = engine.next_task("a", t0).unwrap().task;
    engine.report(&report(&task, "a", TaskOutcome::Done), t0).unwrap();

    let retention = Duration::from_secs(3600);
    assert_eq!(engine.purge_finished(t0 + Duration::from_secs(10), retention), 0);
    assert_eq!(engine.purge_finished(t0 + Duration::from_secs(3601), retention), 1);
    assert!(matches!(engine.job_info(&id), Err(DispatchError::JobNotFound(_))));
}
