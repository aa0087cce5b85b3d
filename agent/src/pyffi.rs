//! Thin wrapper over `pyo3::ffi`'s raw CPython C-API bindings, covering
//! exactly the calls `code_inject.cpp`, `py_gil_stat.cpp`, `trace_profile.c`
//! and `py_stack.cpp` make. This crate intentionally stays below pyo3's
//! high-level `Python<'py>`/`PyAny` layer: the agent runs inside someone
//! else's interpreter and manages its own thread states and GIL
//! acquisitions by hand, the same way the original C extension does, rather
//! than through pyo3's normal "you're called from Python" assumption.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_long};

use pyo3::ffi as py;

/// RAII guard around `PyGILState_Ensure`/`PyGILState_Release`, for call
/// sites that don't already hold a thread state (lock-monitor reporter
/// thread enumerating runtime threads, sending a report).
pub struct GilGuard(py::PyGILState_STATE);

impl GilGuard {
    pub fn acquire() -> Self {
        GilGuard(unsafe { py::PyGILState_Ensure() })
    }
}

impl Drop for GilGuard {
    fn drop(&mut self) {
        unsafe { py::PyGILState_Release(self.0) };
    }
}

/// A thread state created for a background thread the agent itself spawned
/// (the bootstrap worker, the gil-stat worker), mirroring
/// `PyThreadState_New` + `PyEval_AcquireThread`/`ReleaseThread` pairing in
/// the original's `boot_entry` functions.
pub struct OwnedThreadState {
    tstate: *mut py::PyThreadState,
    acquired: bool,
}

unsafe impl Send for OwnedThreadState {}

impl OwnedThreadState {
    /// Creates a new thread state under the given interpreter. Returns
    /// `None` on allocation failure, matching `PyThreadState_New`'s
    /// documented NULL return.
    pub fn new(interp: *mut py::PyInterpreterState) -> Option<Self> {
        let tstate = unsafe { py::PyThreadState_New(interp) };
        if tstate.is_null() {
            None
        } else {
            Some(OwnedThreadState { tstate, acquired: false })
        }
    }

    pub fn acquire(&mut self) {
        if !self.acquired {
            unsafe { py::PyEval_AcquireThread(self.tstate) };
            self.acquired = true;
        }
    }

    pub fn release(&mut self) {
        if self.acquired {
            unsafe { py::PyEval_ReleaseThread(self.tstate) };
            self.acquired = false;
        }
    }

    pub fn as_ptr(&self) -> *mut py::PyThreadState {
        self.tstate
    }
}

impl Drop for OwnedThreadState {
    fn drop(&mut self) {
        // The thread must hold this state when tearing it down, the same
        // acquire-clear-delete sequence `boot_entry` performs before
        // returning.
        self.acquire();
        unsafe {
            py::PyThreadState_Clear(self.tstate);
            py::PyThreadState_DeleteCurrent();
        }
        self.acquired = false;
    }
}

/// The interpreter the currently-held GIL belongs to, used to spawn the
/// bootstrap and gil-stat worker threads against the right interpreter.
pub fn current_interpreter() -> *mut py::PyInterpreterState {
    unsafe { (*py::PyThreadState_Get()).interp }
}

/// `PyThread_init_thread` + `PyThread_start_new_thread`; returns the
/// platform thread identifier, or `None` if thread creation failed
/// (`PYTHREAD_INVALID_THREAD_ID`, all-bits-set).
pub fn start_new_thread(entry: extern "C" fn(*mut std::ffi::c_void), arg: *mut std::ffi::c_void) -> Option<u64> {
    unsafe { py::PyThread_init_thread() };
    let ident = unsafe { py::PyThread_start_new_thread(Some(entry), arg) };
    if ident == usize::MAX {
        None
    } else {
        Some(ident as u64)
    }
}

/// Builds the globals dict `exec_python_file` constructs: `__builtins__`,
/// `__profile_listen_port__`, `__file__`.
pub fn build_script_globals(script_path: &str, port: u16) -> *mut py::PyObject {
    unsafe {
        let globals = py::PyDict_New();
        let builtins = py::PyEval_GetBuiltins();
        let key = CString::new("__builtins__").unwrap();
        py::PyDict_SetItemString(globals, key.as_ptr(), builtins);

        let port_obj = py::PyLong_FromLong(port as c_long);
        let key = CString::new("__profile_listen_port__").unwrap();
        py::PyDict_SetItemString(globals, key.as_ptr(), port_obj);
        py::Py_DECREF(port_obj);

        let path_cstr = CString::new(script_path).unwrap_or_default();
        let path_obj = py::PyUnicode_FromString(path_cstr.as_ptr());
        let key = CString::new("__file__").unwrap();
        py::PyDict_SetItemString(globals, key.as_ptr(), path_obj);
        py::Py_DECREF(path_obj);

        globals
    }
}

/// Runs a script file the way `PyRun_File(fp, file_path, Py_file_input,
/// globals, globals)` does, returning whether it completed without a
/// propagating (non-`SystemExit`) exception.
pub fn run_script_file(path: &str, port: u16) -> Result<(), String> {
    let c_path = match CString::new(path) {
        Ok(p) => p,
        Err(_) => return Err(format!("script path contains a NUL byte: {:?}", path)),
    };
    let mode = CString::new("r").unwrap();
    let fp = unsafe { libc::fopen(c_path.as_ptr(), mode.as_ptr()) };
    if fp.is_null() {
        return Err(format!("could not open script file: {}", path));
    }

    let globals = build_script_globals(path, port);
    let result = unsafe { py::PyRun_File(fp, c_path.as_ptr(), py::Py_file_input, globals, globals) };
    unsafe {
        py::Py_DECREF(globals);
        libc::fclose(fp);
    }

    if result.is_null() {
        let swallowed = exception_matches_system_exit();
        unsafe { py::PyErr_Clear() };
        if swallowed {
            Ok(())
        } else {
            Err("unhandled exception while running injected script".to_string())
        }
    } else {
        unsafe { py::Py_DECREF(result) };
        Ok(())
    }
}

fn exception_matches_system_exit() -> bool {
    unsafe { py::PyErr_ExceptionMatches(py::PyExc_SystemExit) != 0 }
}

/// Reads the running interpreter's `major.minor` version, the way
/// `code_inject_init`'s constructor sscanfs `Py_GetVersion()`.
pub fn runtime_version() -> Option<(u32, u32)> {
    if unsafe { py::Py_IsInitialized() } == 0 {
        return None;
    }
    let version = unsafe { py::Py_GetVersion() };
    if version.is_null() {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(version as *const c_char) };
    let text = cstr.to_string_lossy();
    let mut parts = text.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// `threading.enumerate()` then each thread's `_ident`/`_name`, the way
/// `PyGilStat::dump_thread_name` builds its map. Requires the GIL.
pub fn enumerate_thread_names() -> std::collections::HashMap<u64, String> {
    let mut out = std::collections::HashMap::new();
    unsafe {
        let threading = CString::new("threading").unwrap();
        let module = py::PyImport_ImportModule(threading.as_ptr());
        if module.is_null() {
            py::PyErr_Clear();
            return out;
        }
        let func_name = CString::new("enumerate").unwrap();
        let func = py::PyObject_GetAttrString(module, func_name.as_ptr());
        py::Py_DECREF(module);
        if func.is_null() {
            py::PyErr_Clear();
            return out;
        }
        let empty_args = py::PyTuple_New(0);
        let result = py::PyObject_CallObject(func, empty_args);
        py::Py_DECREF(func);
        py::Py_DECREF(empty_args);
        if result.is_null() {
            py::PyErr_Clear();
            return out;
        }

        let size = py::PyList_Size(result);
        for i in 0..size {
            let thread = py::PyList_GetItem(result, i);
            if thread.is_null() {
                continue;
            }
            let name_attr = CString::new("_name").unwrap();
            let ident_attr = CString::new("_ident").unwrap();
            let name_obj = py::PyObject_GetAttrString(thread, name_attr.as_ptr());
            let ident_obj = py::PyObject_GetAttrString(thread, ident_attr.as_ptr());
            if !name_obj.is_null() && !ident_obj.is_null() {
                let mut size: py::Py_ssize_t = 0;
                let utf8 = py::PyUnicode_AsUTF8AndSize(name_obj, &mut size);
                let ident = py::PyLong_AsUnsignedLong(ident_obj);
                if !utf8.is_null() {
                    let name = std::ffi::CStr::from_ptr(utf8).to_string_lossy().into_owned();
                    out.insert(ident as u64, name);
                }
            }
            py::Py_XDECREF(name_obj);
            py::Py_XDECREF(ident_obj);
            py::PyErr_Clear();
        }
        py::Py_DECREF(result);
    }
    out
}

/// Pushes one message through `out_queue.output_msgstr_nowait(code, msg)`.
/// Requires the GIL.
pub fn output_msgstr_nowait(out_queue: *mut py::PyObject, code: c_int, msg: Option<&str>) {
    unsafe {
        let method_name = CString::new("output_msgstr_nowait").unwrap();
        let method = py::PyObject_GetAttrString(out_queue, method_name.as_ptr());
        if method.is_null() {
            py::PyErr_Clear();
            return;
        }

        let msg_obj = match msg {
            Some(m) => {
                let c = CString::new(m).unwrap_or_default();
                py::PyUnicode_FromString(c.as_ptr())
            }
            None => {
                py::Py_INCREF(py::Py_None());
                py::Py_None()
            }
        };
        let code_obj = py::PyLong_FromLong(code as c_long);

        let args = py::PyTuple_New(2);
        py::PyTuple_SetItem(args, 0, code_obj);
        py::PyTuple_SetItem(args, 1, msg_obj);

        let result = py::PyObject_CallObject(method, args);
        py::Py_XDECREF(result);
        py::Py_DECREF(args);
        py::Py_DECREF(method);
        py::PyErr_Clear();
    }
}
