//! Event helpers and custom assertions for integration tests

use newsweave::Event;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Every event currently buffered in `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    predicate: F,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;

    result.ok().flatten()
}

/// Count events matching `predicate`
pub fn count_events<F>(events: &[Event], predicate: F) -> usize
where
    F: Fn(&Event) -> bool,
{
    events.iter().filter(|e| predicate(e)).count()
}

/// Assert a file exists with exactly `expected` as content
pub fn assert_file_content(path: &Path, expected: &[u8]) {
    let actual = std::fs::read(path).unwrap_or_else(|e| panic!("{} unreadable: {}", path.display(), e));
    assert_eq!(actual.len(), expected.len(), "length of {}", path.display());
    assert!(actual == expected, "content of {} differs", path.display());
}
