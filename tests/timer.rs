use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netio::{
    Interface, InterfaceConfig, TimerCallback, TimerEvent, TimerEventType, TimerOptions,
};

mod util;

use util::{init, DELIVERY};

fn recording_session() -> (TimerCallback, std::sync::mpsc::Receiver<TimerEvent>) {
    let (sender, receiver) = channel();
    let session: TimerCallback = Arc::new(move |event| {
        let _ = sender.send(event);
    });
    (session, receiver)
}

#[test]
fn one_shot_fires_once_near_its_deadline() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let (session, events) = recording_session();

    let deadline = Instant::now() + Duration::from_millis(40);
    let _timer = interface
        .create_timer(TimerOptions::once(deadline), session)
        .unwrap();

    let event = events.recv_timeout(DELIVERY).expect("deadline never fired");
    assert_eq!(event.kind, TimerEventType::Deadline);
    assert_eq!(event.context.deadline, deadline);
    assert!(event.context.now >= deadline);
    assert!(event.context.drift < Duration::from_secs(1));

    // One-shot: no second event.
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
    interface.shutdown();
}

#[test]
fn deadlines_fire_in_order() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let (session, events) = recording_session();

    let base = Instant::now() + Duration::from_millis(30);
    // Registered out of order on purpose.
    for offset in [40u64, 10, 30, 20, 0] {
        let _ = interface
            .create_timer(
                TimerOptions::once(base + Duration::from_millis(offset)),
                Arc::clone(&session),
            )
            .unwrap();
    }

    let mut deadlines = Vec::new();
    for _ in 0..5 {
        let event = events.recv_timeout(DELIVERY).expect("timer missing");
        assert_eq!(event.kind, TimerEventType::Deadline);
        deadlines.push(event.context.deadline);
    }
    let mut sorted = deadlines.clone();
    sorted.sort();
    assert_eq!(deadlines, sorted, "deadlines fired out of order");
    interface.shutdown();
}

/// Periodic rescheduling is deadline-based, so drift does not accumulate:
/// every observed deadline is `t0 + n * period` exactly.
#[test]
fn periodic_timer_does_not_accumulate_drift() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let (session, events) = recording_session();

    let period = Duration::from_millis(10);
    let first = Instant::now() + period;
    let timer = interface
        .create_timer(TimerOptions::periodic(first, period), session)
        .unwrap();

    let fires = 20;
    let mut observed = Vec::new();
    while observed.len() < fires {
        let event = events.recv_timeout(DELIVERY).expect("periodic timer stalled");
        if event.kind == TimerEventType::Deadline {
            observed.push(event.context);
        }
    }
    for (index, context) in observed.iter().enumerate() {
        assert_eq!(
            context.deadline,
            first + period * index as u32,
            "deadline {} drifted",
            index
        );
        assert!(context.drift < Duration::from_millis(500));
    }

    assert!(timer.cancel());
    // Cancellation surfaces as a Canceled session event and stops the
    // recurrence.
    let mut saw_canceled = false;
    while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
        match event.kind {
            TimerEventType::Canceled => {
                saw_canceled = true;
                break;
            }
            // A deadline already in flight when cancel raced is fine.
            TimerEventType::Deadline => continue,
            other => panic!("unexpected event after cancel: {:?}", other),
        }
    }
    assert!(saw_canceled);
    assert!(!timer.cancel(), "second cancel must report not-pending");
    interface.shutdown();
}

#[test]
fn engine_shutdown_closes_pending_timers() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let (session, events) = recording_session();

    let _timer = interface
        .create_timer(
            TimerOptions::once(Instant::now() + Duration::from_secs(3_600)),
            session,
        )
        .unwrap();

    interface.shutdown();
    let event = events.recv_timeout(DELIVERY).expect("no closure event");
    assert_eq!(event.kind, TimerEventType::Closed);
}
