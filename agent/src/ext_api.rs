//! Python-facing entry points. The original splits these across three
//! small extension modules (`trace_profile_C`, `gilstat_C`, `stack_C`),
//! each resolving the real implementation out of the main agent `.so` by
//! symbol name at `PyInit_*` time. This crate keeps A3-A6 in one cdylib,
//! so they're exposed as a single combined extension module instead —
//! the controller-supplied script imports it by the crate's own name and
//! calls these functions the same way it would call the split ones.
//!
//! Grounded on `trace_profile.c`'s `module_methods`/`set_trace_profile`/
//! `remove_trace_profile`/`TraceProfiler_SendTraceFrames`, `gilstat.cpp`'s
//! `init_gil_interceptor`/`deinit_gil_interceptor`, and `stack.cpp`'s
//! `dump_all_threads_stack`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::c_int;

use log::error;
use pyo3::ffi as py;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyList};
use pyo3::wrap_pyfunction;

use flight_profiler_common::LockMonitorConfig;

use crate::lock_monitor::{self, OutQueueSink};
use crate::stack_dump;
use crate::trace_profiler::{NativeFrameDescriptor, TraceProfiler};

/// `OutQueueSink` backed by a real `(queue, port)`-style Python object the
/// controller passed in: `thread_names` calls `threading.enumerate()`
/// through [`crate::pyffi`], `send_nowait` calls the object's
/// `output_msgstr_nowait(code, msg)` method, both requiring the GIL.
struct PyOutQueueSink {
    queue: Py<PyAny>,
}

unsafe impl Send for PyOutQueueSink {}
unsafe impl Sync for PyOutQueueSink {}

impl OutQueueSink for PyOutQueueSink {
    fn thread_names(&self) -> HashMap<u64, String> {
        let _gil = crate::pyffi::GilGuard::acquire();
        crate::pyffi::enumerate_thread_names()
    }

    fn send_nowait(&self, code: i32, msg: Option<&str>) {
        let _gil = crate::pyffi::GilGuard::acquire();
        crate::pyffi::output_msgstr_nowait(self.queue.as_ptr(), code as c_int, msg);
    }
}

/// Starts the big-lock contention monitor. `acquire_addr`/`release_addr`
/// are live in-process addresses the controller already resolved (the way
/// `init_gil_interceptor`'s `take_addr`/`drop_addr` parameters arrive
/// pre-resolved from the caller, no symbol lookup happens on this side).
#[pyfunction]
fn init_py_gil_interceptor(
    out_queue: Py<PyAny>,
    acquire_addr: u64,
    release_addr: u64,
    acquire_warning_ms: i32,
    hold_warning_ms: i32,
    stat_interval_s: i32,
    max_stat_threads: i32,
) -> PyResult<bool> {
    let config = LockMonitorConfig::from_raw(acquire_warning_ms, hold_warning_ms, stat_interval_s, max_stat_threads);
    let sink = Box::new(PyOutQueueSink { queue: out_queue });
    Ok(lock_monitor::start(config, sink, acquire_addr as usize, release_addr as usize))
}

#[pyfunction]
fn deinit_py_gil_interceptor() -> PyResult<bool> {
    lock_monitor::stop();
    Ok(true)
}

/// Holds a running [`TraceProfiler`] plus the Python objects it reports
/// through; passed to `PyEval_SetProfile` as its own `arg`, the same way
/// the original's `TraceProfiler` heap object is both the profiler state
/// and the callback argument.
#[pyclass(unsendable)]
struct TraceProfileHandle {
    profiler: RefCell<Option<TraceProfiler>>,
    target: Py<PyAny>,
    out_queue: Py<PyAny>,
}

#[pyfunction]
#[pyo3(signature = (target, out_queue, interval_ns, is_async, depth_limit))]
fn set_trace_profile(
    py: Python<'_>,
    target: Py<PyAny>,
    out_queue: Py<PyAny>,
    interval_ns: u64,
    is_async: bool,
    depth_limit: i64,
) -> PyResult<Py<TraceProfileHandle>> {
    let handle = Py::new(
        py,
        TraceProfileHandle {
            profiler: RefCell::new(Some(TraceProfiler::new(interval_ns, is_async, depth_limit))),
            target,
            out_queue,
        },
    )?;
    unsafe { py::PyEval_SetProfile(Some(profile_trampoline), handle.as_ptr()) };
    Ok(handle)
}

#[pyfunction]
fn remove_trace_profile(py: Python<'_>, profiler: Py<TraceProfileHandle>) -> PyResult<()> {
    unsafe { py::PyEval_SetProfile(None, std::ptr::null_mut()) };
    let handle = profiler.borrow(py);
    let Some(tp) = handle.profiler.borrow_mut().take() else {
        return Ok(());
    };
    let frames = tp.finish();
    send_trace_frames(py, &handle.target, &handle.out_queue, frames)
}

fn send_trace_frames(
    py: Python<'_>,
    target: &Py<PyAny>,
    out_queue: &Py<PyAny>,
    frames: Vec<Option<flight_profiler_common::grammar::FramePayload>>,
) -> PyResult<()> {
    let list = PyList::empty_bound(py);
    for frame in frames {
        match frame {
            Some(payload) => list.append(PyBytes::new_bound(py, payload.as_bytes()))?,
            None => list.append(py.None())?,
        }
    }
    target.call1(py, (out_queue, list))?;
    Ok(())
}

/// `CO_COROUTINE`, the code-object flag bit `trace_profile.c` tests
/// directly off `code_obj->co_flags`.
const CO_COROUTINE: c_int = 0x80;

unsafe extern "C" fn profile_trampoline(
    obj: *mut py::PyObject,
    frame: *mut py::PyFrameObject,
    what: c_int,
    arg: *mut py::PyObject,
) -> c_int {
    let now_ns = now_ns();
    let py = Python::assume_gil_acquired();
    let handle = match Py::<TraceProfileHandle>::from_borrowed_ptr_or_opt(py, obj) {
        Some(h) => h,
        None => return 0,
    };
    let handle_ref = handle.borrow(py);
    let mut profiler_slot = handle_ref.profiler.borrow_mut();
    let Some(tp) = profiler_slot.as_mut() else { return 0 };

    match what {
        py::PyTrace_CALL | py::PyTrace_C_CALL => {
            let c_frame = what == py::PyTrace_C_CALL;
            if tp.is_async() {
                let is_async_frame = is_coroutine_frame(frame, c_frame);
                let header = frame_header(frame, c_frame, arg);
                let frame_id = frame as usize;
                tp.on_call_async(now_ns, header, is_async_frame, frame_id);
            } else {
                tp.on_call(now_ns);
            }
        }
        py::PyTrace_RETURN | py::PyTrace_C_RETURN | py::PyTrace_C_EXCEPTION => {
            let c_frame = what != py::PyTrace_RETURN;
            let descriptor = frame_descriptor(frame, c_frame, arg);
            if tp.is_async() {
                let is_async_frame = is_coroutine_frame(frame, c_frame);
                tp.on_return_async(now_ns, descriptor, is_async_frame);
            } else {
                tp.on_return(now_ns, descriptor);
            }
        }
        _ => {}
    }
    0
}

fn is_coroutine_frame(frame: *mut py::PyFrameObject, is_c_frame: bool) -> bool {
    if is_c_frame {
        return false;
    }
    unsafe {
        let code = py::PyFrame_GetCode(frame);
        if code.is_null() {
            return false;
        }
        let flags = (*code).co_flags;
        py::Py_DECREF(code as *mut py::PyObject);
        has_coroutine_flag(flags)
    }
}

fn has_coroutine_flag(co_flags: c_int) -> bool {
    co_flags & CO_COROUTINE != 0
}

fn pystring_to_string(obj: *mut py::PyObject) -> String {
    if obj.is_null() {
        return String::new();
    }
    unsafe {
        let mut size: py::Py_ssize_t = 0;
        let utf8 = py::PyUnicode_AsUTF8AndSize(obj, &mut size);
        if utf8.is_null() {
            py::PyErr_Clear();
            return String::new();
        }
        std::ffi::CStr::from_ptr(utf8).to_string_lossy().into_owned()
    }
}

fn frame_header(frame: *mut py::PyFrameObject, is_c_frame: bool, arg: *mut py::PyObject) -> flight_profiler_common::grammar::FrameHeader {
    let d = frame_descriptor(frame, is_c_frame, arg);
    flight_profiler_common::grammar::FrameHeader::new(&d.name, &d.origin, d.linenum)
}

fn frame_descriptor(frame: *mut py::PyFrameObject, is_c_frame: bool, arg: *mut py::PyObject) -> NativeFrameDescriptor {
    if is_c_frame {
        unsafe {
            let qualname_attr = CString::new("__qualname__").unwrap();
            let mut name_obj = py::PyObject_GetAttrString(arg, qualname_attr.as_ptr());
            if name_obj.is_null() {
                py::PyErr_Clear();
                let name_attr = CString::new("__name__").unwrap();
                name_obj = py::PyObject_GetAttrString(arg, name_attr.as_ptr());
            }
            let name = pystring_to_string(name_obj);
            py::Py_XDECREF(name_obj);
            py::PyErr_Clear();
            NativeFrameDescriptor {
                name,
                origin: flight_profiler_common::grammar::NATIVE_ORIGIN.to_string(),
                linenum: 0,
            }
        }
    } else {
        unsafe {
            let code = py::PyFrame_GetCode(frame);
            let name_obj = py::PyCode_GetName(code);
            let file_obj = py::PyCode_GetFileName(code);
            let linenum = py::PyFrame_GetLineNumber(frame) as u32;
            let name = pystring_to_string(name_obj);
            let origin = pystring_to_string(file_obj);
            py::Py_XDECREF(name_obj);
            py::Py_XDECREF(file_obj);
            py::Py_DECREF(code as *mut py::PyObject);
            NativeFrameDescriptor { name, origin, linenum }
        }
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// `dump_all_threads_stack(fd, addr)`: thin wrapper over
/// [`crate::stack_dump::dump_threads`].
#[pyfunction]
fn dump_all_threads_stack(fd: i32, addr: u64) -> PyResult<i32> {
    unsafe { stack_dump::dump_threads(fd, addr) };
    Ok(0)
}

#[pymodule]
fn flight_profiler_agent(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(init_py_gil_interceptor, m)?)?;
    m.add_function(wrap_pyfunction!(deinit_py_gil_interceptor, m)?)?;
    m.add_function(wrap_pyfunction!(set_trace_profile, m)?)?;
    m.add_function(wrap_pyfunction!(remove_trace_profile, m)?)?;
    m.add_function(wrap_pyfunction!(dump_all_threads_stack, m)?)?;
    Ok(())
}

/// Builds the module via its generated `PyInit_flight_profiler_agent` and
/// registers it in `sys.modules`, so the script `boot_entry` runs can
/// `import flight_profiler_agent` the same way the controller would import
/// any of the original's split `_C` modules. Requires the GIL.
pub fn install() {
    unsafe {
        let module = PyInit_flight_profiler_agent();
        if module.is_null() {
            error!("flight-profiler-agent: failed to build the extension module");
            py::PyErr_Clear();
            return;
        }
        let sys_name = CString::new("sys").unwrap();
        let sys = py::PyImport_ImportModule(sys_name.as_ptr());
        if sys.is_null() {
            py::PyErr_Clear();
            py::Py_DECREF(module);
            return;
        }
        let modules_attr = CString::new("modules").unwrap();
        let modules = py::PyObject_GetAttrString(sys, modules_attr.as_ptr());
        py::Py_DECREF(sys);
        if !modules.is_null() {
            let key = CString::new("flight_profiler_agent").unwrap();
            py::PyDict_SetItemString(modules, key.as_ptr(), module);
            py::Py_DECREF(modules);
        }
        py::Py_DECREF(module);
    }
}

// The pyo3-boundary functions above (`init_py_gil_interceptor`,
// `set_trace_profile`, `profile_trampoline`, `install`, ...) need a live
// interpreter to call through `#[pyfunction]`/`#[pymodule]` machinery or to
// dereference a real `PyFrameObject`/`PyCodeObject`, so they're exercised
// indirectly: `lock_monitor`'s and `trace_profiler`'s own test modules cover
// the logic these wrappers delegate to. What's tested directly here is the
// one piece of pure, pointer-free arithmetic this module owns.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coroutine_flag_bit_detected_when_set() {
        assert!(has_coroutine_flag(CO_COROUTINE));
        assert!(has_coroutine_flag(CO_COROUTINE | 0x40));
    }

    #[test]
    fn coroutine_flag_bit_absent_for_plain_function() {
        assert!(!has_coroutine_flag(0));
        assert!(!has_coroutine_flag(0x40));
    }
}
