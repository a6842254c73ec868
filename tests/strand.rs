use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

use netio::{Driver, Interface, InterfaceConfig};

mod util;

use util::{init, DELIVERY};

/// Functors submitted to one strand run in submission order even with
/// several engine threads competing to drain them.
#[test]
fn strand_preserves_fifo_order_across_threads() {
    init();
    let interface = Interface::new(InterfaceConfig {
        thread_count: 4,
        ..InterfaceConfig::default()
    })
    .unwrap();
    let strand = interface.driver().new_strand();

    let total = 1_000usize;
    let (sender, receiver) = channel();
    for index in 0..total {
        let sender = sender.clone();
        strand.execute(Box::new(move || {
            let _ = sender.send(index);
        }));
    }

    let mut observed = Vec::with_capacity(total);
    while observed.len() < total {
        observed.push(receiver.recv_timeout(DELIVERY).expect("strand stalled"));
    }
    assert_eq!(observed, (0..total).collect::<Vec<_>>());
    interface.shutdown();
}

/// Distinct strands drain independently; each keeps its own order.
#[test]
fn independent_strands_interleave_but_stay_ordered() {
    init();
    let interface = Interface::new(InterfaceConfig {
        thread_count: 4,
        ..InterfaceConfig::default()
    })
    .unwrap();

    let (sender, receiver) = channel();
    let strands: Vec<_> = (0..4).map(|_| interface.driver().new_strand()).collect();
    let per_strand = 250usize;
    for (which, strand) in strands.iter().enumerate() {
        for index in 0..per_strand {
            let sender = sender.clone();
            strand.execute(Box::new(move || {
                let _ = sender.send((which, index));
            }));
        }
    }

    let mut last = [None::<usize>; 4];
    for _ in 0..(per_strand * strands.len()) {
        let (which, index) = receiver.recv_timeout(DELIVERY).expect("strands stalled");
        if let Some(previous) = last[which] {
            assert!(index > previous, "strand {} reordered its functors", which);
        }
        last[which] = Some(index);
    }
    interface.shutdown();
}

/// The thread-local current-strand marker is visible from functors and
/// nowhere else.
#[test]
fn current_strand_is_detected_inside_functors() {
    init();
    let interface = Interface::new(InterfaceConfig::default()).unwrap();
    let strand = interface.driver().new_strand();
    let other = interface.driver().new_strand();

    assert!(!strand.is_running_in_this_thread());

    let (sender, receiver) = channel();
    {
        let strand = Arc::clone(&strand);
        let other = Arc::clone(&other);
        let probe = Arc::clone(&strand);
        probe.execute(Box::new(move || {
            let _ = sender.send((
                strand.is_running_in_this_thread(),
                other.is_running_in_this_thread(),
            ));
        }));
    }
    let (own, foreign) = receiver.recv_timeout(DELIVERY).expect("functor stalled");
    assert!(own);
    assert!(!foreign);

    // Still false from an unrelated thread.
    let strand2 = Arc::clone(&strand);
    let handle = thread::spawn(move || strand2.is_running_in_this_thread());
    assert!(!handle.join().unwrap());
    interface.shutdown();
}
