//! A4: big-lock contention monitor. Wraps the runtime's lock-acquire and
//! lock-release entry points via [`crate::hook`], accumulates per-thread
//! timing statistics, and runs a reporter thread that periodically pushes
//! text reports and threshold-triggered warnings to the controller.
//!
//! Grounded on `py_gil_stat.cpp`'s `PyGilStat`: three independent locks
//! (stats map, warnings FIFO, out-queue cell) that are never held
//! simultaneously, and a background thread that polls in 500ms slices so it
//! notices `stop()` promptly without busy-spinning.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flight_profiler_common::LockMonitorConfig;
use log::{error, warn};

use crate::hook::HookTransaction;

const WARNING_FIFO_CAP: usize = 50;
const REPORTER_POLL_SLICE: Duration = Duration::from_millis(500);

/// Distinguishes the two warning kinds. The original emitted `type = 0` for
/// both, a bug its own report-printing code worked around by re-deriving
/// the label from context; this fixes it at the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWarningKind {
    AcquireTooSlow,
    HoldTooLong,
}

impl LockWarningKind {
    fn label(self) -> &'static str {
        match self {
            LockWarningKind::AcquireTooSlow => "take_gil",
            LockWarningKind::HoldTooLong => "hold_gil",
        }
    }
}

#[derive(Debug, Clone)]
struct LockWarning {
    kind: LockWarningKind,
    cost_ns: u64,
    start_ns: u64,
    end_ns: u64,
    thread_id: u64,
    thread_name: String,
    wall_clock_label: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct ThreadStats {
    last_acquire_enter_ns: u64,
    last_acquire_success_ns: u64,
    last_release_enter_ns: u64,
    last_acquire_cost_ns: u64,
    acquire_total_cost_ns: u64,
    acquire_count: u64,
    release_total_cost_ns: u64,
    release_count: u64,
    hold_total_ns: u64,
}

/// Enumerates runtime threads and delivers text reports back into the
/// runtime, both of which require the runtime lock and callable access the
/// monitor itself has no business holding directly. Implemented against
/// the real interpreter in `pyffi`/`bootstrap`; a fake is trivial for tests.
pub trait OutQueueSink: Send + Sync {
    /// Maps native thread id -> human name, the way `threading.enumerate()`
    /// does for the real interpreter. Called with the runtime lock held.
    fn thread_names(&self) -> HashMap<u64, String>;
    /// Pushes one message (`code` 0 for data, 1 for the end sentinel).
    /// Called with the runtime lock held.
    fn send_nowait(&self, code: i32, msg: Option<&str>);
}

struct MonitorState {
    stats: Mutex<HashMap<u64, ThreadStats>>,
    warnings: Mutex<VecDeque<LockWarning>>,
    sink: Mutex<Option<Box<dyn OutQueueSink>>>,
    config: LockMonitorConfig,
    running: AtomicBool,
}

static STATE: OnceLock<MonitorState> = OnceLock::new();
static HOOK_IDS: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static REPORTER: Mutex<Option<std::thread::JoinHandle<()>>> = Mutex::new(None);

fn state() -> Option<&'static MonitorState> {
    STATE.get()
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

fn native_thread_name(tid: u64) -> String {
    let mut buf = [0u8; 16];
    let rc = unsafe {
        libc::pthread_getname_np(tid as libc::pthread_t, buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if rc != 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn thread_is_alive(tid: u64) -> bool {
    // A zero signal delivers no signal but still validates the thread
    // exists; ESRCH means it has exited.
    unsafe { libc::pthread_kill(tid as libc::pthread_t, 0) == 0 }
}

/// Starts the monitor: installs both hooks in one transaction and spawns
/// the reporter thread. No-op (returns `false`) if already running.
pub fn start(
    config: LockMonitorConfig,
    sink: Box<dyn OutQueueSink>,
    acquire_addr: usize,
    release_addr: usize,
) -> bool {
    if STATE.get().is_some() {
        warn!("lock monitor already started");
        return false;
    }

    let _ = STATE.set(MonitorState {
        stats: Mutex::new(HashMap::new()),
        warnings: Mutex::new(VecDeque::new()),
        sink: Mutex::new(Some(sink)),
        config,
        running: AtomicBool::new(true),
    });

    let mut txn = HookTransaction::begin();
    let acquire_enter_id = txn.attach(acquire_addr, on_acquire_enter, on_acquire_leave);
    let release_enter_id = txn.attach(release_addr, on_release_enter, on_release_leave);
    if !txn.commit() {
        error!("failed to install lock-monitor hooks");
        return false;
    }

    let mut ids = HOOK_IDS.lock().unwrap();
    if let Some(id) = acquire_enter_id {
        ids.push(id);
    }
    if let Some(id) = release_enter_id {
        ids.push(id);
    }
    drop(ids);

    let handle = std::thread::Builder::new()
        .name("lock-monitor-reporter".into())
        .spawn(reporter_loop)
        .expect("failed to spawn lock-monitor reporter thread");
    *REPORTER.lock().unwrap() = Some(handle);
    true
}

/// Stops the monitor: flips `running` off, sends the end-of-stream
/// sentinel, clears both collections, and joins the reporter thread, in
/// that order so the reporter never observes a half-torn-down state.
pub fn stop() {
    let Some(st) = state() else { return };
    if !st.running.swap(false, Ordering::SeqCst) {
        return;
    }

    if let Some(sink) = st.sink.lock().unwrap().as_ref() {
        sink.send_nowait(1, None);
    }
    *st.sink.lock().unwrap() = None;

    st.stats.lock().unwrap().clear();
    st.warnings.lock().unwrap().clear();

    if let Some(handle) = REPORTER.lock().unwrap().take() {
        let _ = handle.join();
    }

    let ids: Vec<u32> = HOOK_IDS.lock().unwrap().drain(..).collect();
    crate::hook::uninstall_all(&ids);
}

fn reporter_loop() {
    let Some(st) = state() else { return };
    let interval = Duration::from_secs(st.config.stat_interval_s as u64);
    let mut last = std::time::Instant::now();
    while st.running.load(Ordering::SeqCst) {
        if last.elapsed() >= interval {
            report_once(st);
            last = std::time::Instant::now();
            continue;
        }
        std::thread::sleep(REPORTER_POLL_SLICE);
    }
}

fn report_once(st: &MonitorState) {
    let thread_names = {
        let sink_guard = st.sink.lock().unwrap();
        match sink_guard.as_ref() {
            Some(sink) => sink.thread_names(),
            None => return,
        }
    };

    dump_warnings(st, &thread_names);
    dump_stats(st, &thread_names);
}

fn dump_stats(st: &MonitorState, thread_names: &HashMap<u64, String>) {
    let cap = st.config.max_stat_threads as usize;
    let mut snapshot: Vec<(u64, ThreadStats)> = Vec::new();
    let mut dead: Vec<u64> = Vec::new();
    {
        let map = st.stats.lock().unwrap();
        for (&tid, stats) in map.iter() {
            if snapshot.len() >= cap {
                break;
            }
            if stats.acquire_count > 0 && stats.release_count > 0 {
                snapshot.push((tid, *stats));
            }
        }
    }

    if !snapshot.is_empty() {
        let mut report = String::new();
        report.push_str(&format!(
            "\nlock statistics report:\n{:<18}{:<24}{:<12}{:<18}{:<12}{:<18}{:<12}{:<12}{:<18}{:<12}\n",
            "thread_id", "thread_name", "takecnt", "hold_all(ns)", "holdavg(ns)",
            "take_all(ns)", "takeavg(ns)", "dropcnt", "drop_all(ns)", "dropavg(ns)"
        ));
        for (tid, s) in &snapshot {
            let name = thread_names
                .get(tid)
                .cloned()
                .unwrap_or_else(|| native_thread_name(*tid));
            report.push_str(&format!(
                "{:<18x}{:<24}{:<12}{:<18}{:<12}{:<18}{:<12}{:<12}{:<18}{:<12}\n",
                tid,
                name,
                s.acquire_count,
                s.hold_total_ns,
                s.hold_total_ns / s.acquire_count,
                s.acquire_total_cost_ns,
                s.acquire_total_cost_ns / s.acquire_count,
                s.release_count,
                s.release_total_cost_ns,
                s.release_total_cost_ns / s.release_count.max(1),
            ));
        }
        let sink_guard = st.sink.lock().unwrap();
        if let Some(sink) = sink_guard.as_ref() {
            sink.send_nowait(0, Some(&report));
        }
    }

    for (tid, _) in &snapshot {
        if !thread_is_alive(*tid) {
            dead.push(*tid);
        }
    }
    if !dead.is_empty() {
        let mut map = st.stats.lock().unwrap();
        for tid in dead {
            map.remove(&tid);
        }
    }
}

fn dump_warnings(st: &MonitorState, thread_names: &HashMap<u64, String>) {
    let drained: Vec<LockWarning> = {
        let mut warnings = st.warnings.lock().unwrap();
        warnings.drain(..).collect()
    };
    if drained.is_empty() {
        return;
    }

    let mut report = String::new();
    report.push_str(&format!(
        "\nlock warning report:\n{:<26}{:<18}{:<24}{:<12}{:<18}{:<18}{:<30}{:<30}\n",
        "time", "thread_id", "thread_name", "event", "cost(ns)", "threshold(ns)", "start(ns)", "end(ns)"
    ));
    for w in &drained {
        let name = thread_names
            .get(&w.thread_id)
            .cloned()
            .unwrap_or_else(|| w.thread_name.clone());
        let threshold_ns = match w.kind {
            LockWarningKind::AcquireTooSlow => st.config.acquire_warning_ms as u64 * 1_000_000,
            LockWarningKind::HoldTooLong => st.config.hold_warning_ms as u64 * 1_000_000,
        };
        report.push_str(&format!(
            "{:<26}{:<18x}{:<24}{:<12}{:<18}{:<18}{:<30}{:<30}\n",
            w.wall_clock_label, w.thread_id, name, w.kind.label(), w.cost_ns, threshold_ns, w.start_ns, w.end_ns
        ));
    }

    let sink_guard = st.sink.lock().unwrap();
    if let Some(sink) = sink_guard.as_ref() {
        sink.send_nowait(0, Some(&report));
    }
}

fn push_warning(st: &MonitorState, warning: LockWarning) {
    let mut warnings = st.warnings.lock().unwrap();
    if warnings.len() >= WARNING_FIFO_CAP {
        warnings.pop_front();
    }
    warnings.push_back(warning);
}

fn wall_clock_label_now() -> String {
    // Millisecond-precision label; the original used `strftime` against a
    // captured `timespec`, we only need something monotonic-looking for the
    // report and don't need to match its exact format.
    let ns = now_ns();
    format!("{}.{:03}", ns / 1_000_000_000, (ns / 1_000_000) % 1000)
}

extern "C" fn on_acquire_enter() {
    let Some(st) = state() else { return };
    let tid = current_thread_id();
    let mut map = st.stats.lock().unwrap();
    let entry = map.entry(tid).or_insert_with(ThreadStats::default);
    entry.last_acquire_enter_ns = now_ns();
}

extern "C" fn on_acquire_leave() {
    let Some(st) = state() else { return };
    let tid = current_thread_id();
    let mut map = st.stats.lock().unwrap();
    let Some(entry) = map.get_mut(&tid) else {
        drop(map);
        warn!("lock statistics not found on acquire-leave");
        return;
    };
    if entry.last_acquire_enter_ns == 0 {
        drop(map);
        warn!("last acquire-enter not found on acquire-leave");
        return;
    }
    let success = now_ns();
    entry.last_acquire_success_ns = success;
    entry.acquire_count += 1;
    entry.last_acquire_cost_ns = success.saturating_sub(entry.last_acquire_enter_ns);
    entry.acquire_total_cost_ns += entry.last_acquire_cost_ns;
}

extern "C" fn on_release_enter() {
    let Some(st) = state() else { return };
    let tid = current_thread_id();
    let mut map = st.stats.lock().unwrap();
    match map.get_mut(&tid) {
        Some(entry) => entry.last_release_enter_ns = now_ns(),
        None => {
            drop(map);
            warn!("lock statistics not found on release-enter");
        }
    }
}

extern "C" fn on_release_leave() {
    let Some(st) = state() else { return };
    let tid = current_thread_id();

    let (cost_ns, start_ns, end_ns, hold_ns, hold_start, acquire_warn, hold_warn) = {
        let mut map = st.stats.lock().unwrap();
        let Some(entry) = map.get_mut(&tid) else {
            drop(map);
            warn!("lock statistics not found on release-leave");
            return;
        };
        if entry.last_acquire_enter_ns == 0 || entry.last_acquire_success_ns == 0 {
            drop(map);
            warn!("last acquire not found on release-leave");
            return;
        }
        if entry.last_release_enter_ns == 0 {
            drop(map);
            warn!("last release-enter not found on release-leave");
            return;
        }

        let release_success = now_ns();
        entry.release_count += 1;
        let release_cost = release_success.saturating_sub(entry.last_release_enter_ns);
        entry.release_total_cost_ns += release_cost;
        let hold = release_success.saturating_sub(entry.last_acquire_success_ns);
        entry.hold_total_ns += hold;

        let acquire_warn = entry.last_acquire_cost_ns > st.config.acquire_warning_ms as u64 * 1_000_000;
        let hold_warn = hold > st.config.hold_warning_ms as u64 * 1_000_000;
        (
            entry.last_acquire_cost_ns,
            entry.last_acquire_enter_ns,
            entry.last_acquire_success_ns,
            hold,
            entry.last_acquire_success_ns,
            acquire_warn,
            hold_warn,
        )
    };

    let label = wall_clock_label_now();
    let name = native_thread_name(tid);

    if acquire_warn {
        push_warning(
            st,
            LockWarning {
                kind: LockWarningKind::AcquireTooSlow,
                cost_ns,
                start_ns,
                end_ns,
                thread_id: tid,
                thread_name: name.clone(),
                wall_clock_label: label.clone(),
            },
        );
    }
    if hold_warn {
        push_warning(
            st,
            LockWarning {
                kind: LockWarningKind::HoldTooLong,
                cost_ns: hold_ns,
                start_ns: hold_start,
                end_ns: hold_start + hold_ns,
                thread_id: tid,
                thread_name: name,
                wall_clock_label: label,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl OutQueueSink for NullSink {
        fn thread_names(&self) -> HashMap<u64, String> {
            HashMap::new()
        }
        fn send_nowait(&self, _code: i32, _msg: Option<&str>) {}
    }

    #[test]
    fn warning_kind_labels_are_distinct() {
        assert_eq!(LockWarningKind::AcquireTooSlow.label(), "take_gil");
        assert_eq!(LockWarningKind::HoldTooLong.label(), "hold_gil");
        assert_ne!(
            LockWarningKind::AcquireTooSlow.label(),
            LockWarningKind::HoldTooLong.label()
        );
    }

    #[test]
    fn push_warning_caps_fifo_at_fifty() {
        let st = MonitorState {
            stats: Mutex::new(HashMap::new()),
            warnings: Mutex::new(VecDeque::new()),
            sink: Mutex::new(Some(Box::new(NullSink))),
            config: LockMonitorConfig::default(),
            running: AtomicBool::new(true),
        };
        for i in 0..60 {
            push_warning(
                &st,
                LockWarning {
                    kind: LockWarningKind::AcquireTooSlow,
                    cost_ns: i,
                    start_ns: 0,
                    end_ns: 0,
                    thread_id: 1,
                    thread_name: "t".into(),
                    wall_clock_label: "0".into(),
                },
            );
        }
        assert!(st.warnings.lock().unwrap().len() <= WARNING_FIFO_CAP);
    }
}
