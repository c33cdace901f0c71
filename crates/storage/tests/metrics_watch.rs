use chrono::{TimeZone, Utc};
use std::sync::{Mutex, OnceLock};
use telemux_storage::{dec_backlog, inc_backlog, set_last_flush, storage_metrics_watch};

fn with_metrics_lock<T>(f: impl FnOnce() -> T) -> T {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let guard = LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .expect("metrics lock poisoned");
    let out = f();
    drop(guard);
    out
}

#[test]
fn metrics_channel_reflects_backlog_and_flush_updates() {
    with_metrics_lock(|| {
        let rx = storage_metrics_watch();
        let baseline = { rx.borrow().clone() };

        inc_backlog();
        let after_inc = { rx.borrow().clone() };
        assert_eq!(after_inc.backlog_count, baseline.backlog_count + 1);

        dec_backlog();
        let after_dec = { rx.borrow().clone() };
        assert_eq!(after_dec.backlog_count, baseline.backlog_count);

        let flush_time = Utc.with_ymd_and_hms(2024, 4, 22, 12, 0, 0).unwrap();
        set_last_flush(flush_time);
        let after_flush = { rx.borrow().clone() };
        assert_eq!(after_flush.last_flush_at, Some(flush_time));
    });
}

#[test]
fn backlog_never_wraps_below_zero() {
    with_metrics_lock(|| {
        let rx = storage_metrics_watch();
        let baseline = { rx.borrow().backlog_count };
        for _ in 0..=baseline {
            dec_backlog();
        }
        assert_eq!(rx.borrow().backlog_count, 0);
    });
}
