//! The process-global sink slot. Runs in its own process because it installs
//! the global subscriber.

use std::sync::Arc;

use cbnet_logging::{install_sink, is_sink_installed, uninstall_sink, LogControl, LogHandler, LogLevel};
use parking_lot::Mutex;

type Records = Arc<Mutex<Vec<String>>>;

fn control() -> (Arc<LogControl>, Records) {
    let records: Records = Arc::default();
    let sink = Arc::clone(&records);
    let handler: LogHandler = Arc::new(move |_level, msg: &str| sink.lock().push(msg.to_string()));
    (Arc::new(LogControl::new(LogLevel::Info, Some(handler))), records)
}

#[test]
fn test_global_sink_follows_latest_install() {
    let (first, first_records) = control();
    let (second, second_records) = control();

    tracing::info!("before any sink");
    install_sink(Arc::clone(&first)).unwrap();
    tracing::info!("to first");
    assert_eq!(first_records.lock().as_slice(), &["to first".to_string()]);

    install_sink(Arc::clone(&second)).unwrap();
    assert!(is_sink_installed(&second));
    tracing::info!("to second");
    assert_eq!(first_records.lock().len(), 1);
    assert_eq!(second_records.lock().as_slice(), &["to second".to_string()]);

    // A stale owner cannot clear the slot it no longer holds.
    assert!(!uninstall_sink(&first));
    assert!(is_sink_installed(&second));

    second.set_level(LogLevel::Error);
    tracing::warn!("filtered");
    assert_eq!(second_records.lock().len(), 1);

    assert!(uninstall_sink(&second));
    assert!(!is_sink_installed(&second));
    tracing::error!("to nobody");
    assert_eq!(first_records.lock().len(), 1);
    assert_eq!(second_records.lock().len(), 1);
}
