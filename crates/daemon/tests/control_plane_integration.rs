mod common;

use common::{registration, wait_until, Harness, MemoryStore};
use dtn_control::broadcast::Broadcast;
use dtn_control::controller::DaemonEvent;
use dtn_control::dispatcher::{Action, ReplyTarget};
use dtn_control::error::ControlError;
use dtn_control::state::DaemonState;
use dtn_control::ControlPlane;
use std::sync::atomic::Ordering;

fn started(harness: &Harness, auto_start: bool) -> ControlPlane {
    ControlPlane::initialize(harness.collaborators(auto_start), "dtn").unwrap()
}

fn wait_for_release(harness: &Harness, start_id: u64) {
    assert!(
        wait_until(|| harness.host.releases().contains(&Some(start_id))),
        "no release for start id {}",
        start_id
    );
}

/// **Feature: dtn-control, Property 1: Placeholder precedes neighbor-derived status**
/// After entering ONLINE the surface shows the placeholder before any neighbor
/// count is queried.
#[test]
fn test_online_shows_placeholder_before_neighbor_query() {
    let harness = Harness::new();
    let plane = started(&harness, true);

    assert!(wait_until(|| harness.journal.count("show:no neighbors") > 0));

    let placeholder = harness.journal.position("show:pending").unwrap();
    let first_query = harness.journal.position("neighbors").unwrap();
    assert!(placeholder < first_query);
    assert!(harness.host.privileged.load(Ordering::SeqCst));
    assert!(plane.presenter().is_visible());
    assert_eq!(plane.last_start_id(), Some(1));

    plane.destroy();
}

#[test]
fn test_offline_without_auto_start_hides_and_terminates_once() {
    let harness = Harness::new();
    let plane = started(&harness, false);

    plane.start_command(Some(Action::Startup)).unwrap();
    assert!(wait_until(|| harness.controller.machine.current() == DaemonState::Online));

    let shutdown_id = plane.start_command(Some(Action::Shutdown)).unwrap();
    wait_for_release(&harness, shutdown_id);

    assert_eq!(harness.journal.count("hide"), 1);
    assert_eq!(harness.host.terminations.load(Ordering::SeqCst), 1);
    assert!(!harness.host.privileged.load(Ordering::SeqCst));
    assert_eq!(harness.host.releases()[0], Some(shutdown_id));

    // Broadcasts follow the transitions in order.
    assert!(wait_until(|| harness.broadcaster.states().len() == 3));
    assert_eq!(
        harness.broadcaster.states(),
        vec![DaemonState::Pending, DaemonState::Online, DaemonState::Offline]
    );

    plane.destroy();
}

#[test]
fn test_offline_with_auto_start_skips_hide_and_terminate() {
    let harness = Harness::new();
    let plane = started(&harness, true);
    assert!(wait_until(|| harness.controller.machine.current() == DaemonState::Online));

    let shutdown_id = plane.start_command(Some(Action::Shutdown)).unwrap();
    // The idle-and-offline release still fires; only the lifecycle reaction is skipped.
    wait_for_release(&harness, shutdown_id);

    assert_eq!(harness.journal.count("hide"), 0);
    assert_eq!(harness.host.terminations.load(Ordering::SeqCst), 0);
    assert!(plane.presenter().is_visible());

    plane.destroy();
}

#[test]
fn test_refresh_while_hidden_touches_no_surface() {
    let harness = Harness::new();
    let plane = started(&harness, false);

    assert!(!plane.presenter().is_visible());
    assert_eq!(plane.presenter().refresh(), Some("offline".to_string()));
    assert!(harness
        .journal
        .entries()
        .iter()
        .all(|entry| !entry.starts_with("show:")));

    plane.destroy();
}

#[test]
fn test_neighborhood_change_refreshes_without_broadcast() {
    let harness = Harness::new();
    let plane = started(&harness, true);
    assert!(wait_until(|| harness.journal.count("show:no neighbors") > 0));
    assert!(wait_until(|| harness.broadcaster.states().len() == 2));

    harness.controller.set_neighbors(3);
    assert!(wait_until(|| harness.journal.count("show:3 neighbors") > 0));

    harness.controller.set_neighbors(1);
    assert!(wait_until(|| harness.journal.count("show:1 neighbors") > 0));

    assert_eq!(harness.broadcaster.states().len(), 2);

    plane.destroy();
}

#[test]
fn test_daemon_events_are_forwarded() {
    let harness = Harness::new();
    let plane = started(&harness, false);

    let event = DaemonEvent::new("bundle_received").with_attribute("source", "dtn://node-b");
    harness.controller.emit(event.clone());

    assert_eq!(
        *harness.broadcaster.sent.lock().unwrap(),
        vec![Broadcast::Event(event)]
    );

    plane.destroy();
}

#[test]
fn test_restart_never_reports_offline() {
    let harness = Harness::new();
    let plane = started(&harness, false);

    plane.start_command(None).unwrap();
    assert!(wait_until(|| harness.controller.machine.current() == DaemonState::Online));

    let restart_id = plane
        .start_command(Some(Action::Restart { level: 2 }))
        .unwrap();
    assert!(wait_until(|| harness.journal.count("restart:2") == 1));
    assert!(wait_until(|| harness.broadcaster.states().len() == 4));

    assert_eq!(
        harness.broadcaster.states(),
        vec![
            DaemonState::Pending,
            DaemonState::Online,
            DaemonState::Pending,
            DaemonState::Online
        ]
    );
    assert_eq!(harness.journal.count("hide"), 0);
    assert!(!harness.host.releases().contains(&Some(restart_id)));

    plane.destroy();
}

#[test]
fn test_failed_command_does_not_stop_dispatch() {
    let harness = Harness::new();
    harness.controller.fail_start.store(true, Ordering::SeqCst);
    let plane = started(&harness, false);

    plane.start_command(Some(Action::Startup)).unwrap();
    let unregister_id = plane
        .start_command(Some(Action::Unregister {
            reply_target: ReplyTarget::new("org.example.nobody"),
        }))
        .unwrap();

    wait_for_release(&harness, unregister_id);
    assert_eq!(harness.journal.count("start"), 1);
    assert_eq!(harness.controller.machine.current(), DaemonState::Offline);

    plane.destroy();
}

/// **Feature: dtn-control, Property 2: Re-registration replaces the session**
#[test]
fn test_second_registration_replaces_first() {
    let harness = Harness::new();
    let plane = started(&harness, false);
    let target = ReplyTarget::new("org.example.appA");

    plane
        .start_command(Some(Action::Register {
            registration: registration("spec1"),
            reply_target: target.clone(),
        }))
        .unwrap();
    let second = plane
        .start_command(Some(Action::Register {
            registration: registration("spec2"),
            reply_target: target.clone(),
        }))
        .unwrap();
    wait_for_release(&harness, second);

    let session = plane.registry().lookup("org.example.appA").unwrap();
    assert_eq!(session.registration.endpoint, "spec2");
    assert_eq!(plane.registry().len(), 1);

    let issued = harness.binder.issued();
    assert_eq!(issued.len(), 2);
    assert_eq!(issued[0].releases.load(Ordering::SeqCst), 1);
    assert_eq!(issued[1].releases.load(Ordering::SeqCst), 0);

    let service = plane.service();
    assert_eq!(
        service.get_session("org.example.appA").unwrap().handle_id(),
        issued[1].id
    );
    assert_eq!(harness.store.caller_ids(), vec!["org.example.appA"]);

    plane.destroy();
}

#[test]
fn test_unregister_unknown_caller_is_noop() {
    let harness = Harness::new();
    let plane = started(&harness, false);

    let id = plane
        .start_command(Some(Action::Unregister {
            reply_target: ReplyTarget::new("org.example.ghost"),
        }))
        .unwrap();
    wait_for_release(&harness, id);

    assert!(plane.registry().is_empty());
    assert!(harness.binder.issued().is_empty());

    plane.destroy();
}

#[test]
fn test_sessions_restored_at_initialize() {
    let harness = Harness::with_store(MemoryStore::with(&[
        ("org.example.a", registration("chat")),
        ("org.example.b", registration("mail")),
    ]));
    harness.binder.refuse("org.example.b");

    let plane = started(&harness, false);

    assert_eq!(plane.registry().caller_ids(), vec!["org.example.a"]);
    assert_eq!(plane.service().get_session("org.example.b").map(|_| ()), None);

    plane.destroy();

    assert!(plane.registry().is_empty());
    assert_eq!(harness.binder.issued()[0].releases.load(Ordering::SeqCst), 1);
    // Persisted registrations outlive teardown.
    assert_eq!(harness.store.caller_ids().len(), 2);
}

#[test]
fn test_destroy_is_idempotent_and_closes_the_queue() {
    let harness = Harness::new();
    let plane = started(&harness, false);

    plane.destroy();
    plane.destroy();

    assert!(plane.is_destroyed());
    assert_eq!(harness.journal.count("destroy"), 1);
    assert!(harness.controller.destroyed.load(Ordering::SeqCst));
    assert!(plane.sender().is_closed());
    assert!(matches!(
        plane.start_command(Some(Action::Startup)),
        Err(ControlError::DispatcherClosed)
    ));
}

#[test]
fn test_queries_bypass_the_queue() {
    let harness = Harness::new();
    let plane = started(&harness, false);
    let service = plane.service();

    assert_eq!(service.get_state(), DaemonState::Offline);
    assert!(!service.is_running());
    assert_eq!(service.get_version().unwrap()[0], "1.0.1");
    service.clear_storage().unwrap();
    assert_eq!(harness.journal.count("clear_storage"), 1);

    plane.destroy();

    // Still answered after the dispatcher is gone.
    assert_eq!(service.get_state(), DaemonState::Offline);
}

#[test]
fn test_controller_initialize_failure_is_not_fatal() {
    let harness = Harness::new();
    harness
        .controller
        .fail_initialize
        .store(true, Ordering::SeqCst);

    let plane = started(&harness, false);

    plane.start_command(Some(Action::Startup)).unwrap();
    assert!(wait_until(|| harness.controller.machine.current() == DaemonState::Online));
    assert_eq!(harness.journal.count("start"), 1);
    // No handler was installed, so nothing reacted to the transitions.
    assert!(harness.broadcaster.states().is_empty());

    plane.destroy();
}
