//! Session lifecycle timing: heartbeat, bounded reconnect, termination.
//!
//! All tests run on paused time; the runtime jumps straight to the next
//! timer once every task is idle.

use std::sync::Arc;

use tandem_collab::error::ServiceError;
use tandem_collab::lifecycle::{
    Destination, LifecycleCommand, NoResources, NoticeBoard, SessionEvent, SessionLifecycle,
    SessionState, TerminationReason, NOTICE_PARTNER_LEFT, NOTICE_RECONNECT,
    NOTICE_RECONNECT_FAILED,
};
use tandem_collab::matchmaking::confirm_scripted;
use tandem_collab::protocol::{AppMessage, AppMessageKind};
use tandem_collab::socket::{MemoryCollabService, MemorySocketConnector};
use tandem_collab::SessionConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

struct Harness {
    connector: MemorySocketConnector,
    service: MemoryCollabService,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::Sender<LifecycleCommand>,
    task: JoinHandle<TerminationReason>,
}

async fn connected() -> Harness {
    let connector = MemorySocketConnector::new();
    let service = MemoryCollabService::new("print(1)");
    let confirmed = confirm_scripted("r1", "u1").await.unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    let mut lc = SessionLifecycle::new(
        SessionConfig::default(),
        &confirmed,
        Arc::new(connector.clone()),
        Arc::new(service.clone()),
        tx,
    );
    lc.connect().await.unwrap();
    assert_eq!(lc.state(), SessionState::Connected);

    let (commands, command_rx) = mpsc::channel(4);
    let task = tokio::spawn(lc.run(command_rx, Box::new(NoResources)));
    settle().await;
    Harness {
        connector,
        service,
        events,
        commands,
        task,
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = events.try_recv() {
        out.push(ev);
    }
    out
}

fn reconnect_attempts(events: &[SessionEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_every_interval_while_connected() {
    let h = connected().await;
    sleep(Duration::from_secs(185)).await;
    settle().await;
    assert_eq!(h.connector.count_sent(&AppMessageKind::Heartbeat), 3);
    assert_eq!(h.connector.count_sent(&AppMessageKind::Connect), 1);
    assert!(!h.task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_no_heartbeat_while_disconnected() {
    let h = connected().await;
    sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(h.connector.count_sent(&AppMessageKind::Heartbeat), 1);

    h.connector.fail_next_opens(100);
    h.connector.drop_connection();
    sleep(Duration::from_secs(24)).await;
    settle().await;
    assert_eq!(h.connector.count_sent(&AppMessageKind::Heartbeat), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_five_failures() {
    let mut h = connected().await;
    h.connector.fail_next_opens(100);
    h.connector.drop_connection();

    let reason = h.task.await.unwrap();
    assert_eq!(reason, TerminationReason::ReconnectExhausted);
    assert_eq!(h.connector.failed_opens(), 5);

    let events = drain(&mut h.events);
    assert_eq!(reconnect_attempts(&events), vec![1, 2, 3, 4, 5]);
    assert!(events.iter().any(
        |e| matches!(e, SessionEvent::Notice(n) if n.id == NOTICE_RECONNECT_FAILED)
    ));
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Navigate(Destination::Matchmaking))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_for_delay() {
    let h = connected().await;
    h.connector.drop_connection();
    sleep(Duration::from_millis(4_900)).await;
    settle().await;
    assert_eq!(h.connector.opens(), 1);
    sleep(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(h.connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_successful_reconnect_resets_counter() {
    let mut h = connected().await;
    h.connector.fail_next_opens(2);
    h.connector.drop_connection();

    // Three delays: two failures, then success.
    sleep(Duration::from_secs(16)).await;
    settle().await;
    assert!(h.connector.is_connected());
    assert_eq!(h.service.reconnects(), 1);
    assert_eq!(h.connector.count_sent(&AppMessageKind::Reconnect), 1);
    assert_eq!(h.connector.count_sent(&AppMessageKind::Connect), 1);

    let events = drain(&mut h.events);
    assert_eq!(reconnect_attempts(&events), vec![1, 2, 3]);
    assert!(events.contains(&SessionEvent::NoticeCleared(NOTICE_RECONNECT.to_string())));
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == SessionEvent::StateChanged(SessionState::Connected))
            .count(),
        2
    );

    // A later drop starts counting from one again.
    h.connector.drop_connection();
    settle().await;
    let events = drain(&mut h.events);
    assert_eq!(reconnect_attempts(&events), vec![1]);

    // Heartbeats resume once the second reconnect is acknowledged.
    sleep(Duration::from_secs(5)).await;
    settle().await;
    let before = h.connector.count_sent(&AppMessageKind::Heartbeat);
    sleep(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(h.connector.count_sent(&AppMessageKind::Heartbeat), before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_reconnect_counts_as_failure() {
    let mut h = connected().await;
    h.service
        .fail_next_reconnect(ServiceError::Unavailable("503".into()));
    h.connector.drop_connection();

    sleep(Duration::from_secs(11)).await;
    settle().await;
    assert_eq!(h.connector.opens(), 3);
    assert_eq!(h.service.reconnects(), 1);
    let events = drain(&mut h.events);
    assert_eq!(reconnect_attempts(&events), vec![1, 2]);
    assert!(h.connector.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_notice_is_never_stacked() {
    let mut h = connected().await;
    h.connector.fail_next_opens(3);
    h.connector.drop_connection();
    sleep(Duration::from_secs(25)).await;
    settle().await;

    let mut board = NoticeBoard::new();
    let mut texts = Vec::new();
    for ev in drain(&mut h.events) {
        match ev {
            SessionEvent::Notice(n) if n.id == NOTICE_RECONNECT => {
                texts.push(n.text.clone());
                board.show(n);
                assert_eq!(board.len(), 1);
            }
            SessionEvent::NoticeCleared(id) => {
                board.clear(&id);
            }
            _ => {}
        }
    }
    assert_eq!(texts.len(), 4);
    assert!(texts[0].contains("(1/5)"));
    assert!(texts[3].contains("(4/5)"));
    assert!(board.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partner_left_shows_notice_and_stays() {
    let mut h = connected().await;
    assert!(h
        .connector
        .push(AppMessage::new("", "r1", AppMessageKind::PartnerLeft)));
    settle().await;
    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Notice(n) if n.id == NOTICE_PARTNER_LEFT)));
    assert!(!h.task.is_finished());

    h.commands.send(LifecycleCommand::Exit).await.unwrap();
    assert_eq!(h.task.await.unwrap(), TerminationReason::UserExit);
    assert_eq!(h.service.terminations().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_partner_termination_leaves_after_delay() {
    let mut h = connected().await;
    assert!(h
        .connector
        .push(AppMessage::new("", "r1", AppMessageKind::MatchTerminate)));
    let reason = h.task.await.unwrap();
    assert_eq!(reason, TerminationReason::PartnerTerminated);
    assert!(h.service.terminations().is_empty());

    let events = drain(&mut h.events);
    assert!(events.contains(&SessionEvent::Terminated(TerminationReason::PartnerTerminated)));
    assert_eq!(events.last(), Some(&SessionEvent::Navigate(Destination::Home)));
}
