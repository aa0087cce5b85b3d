//! A6: on-demand thread-stack dump. Resolves the runtime's internal
//! traceback-dump symbol via [`crate::symbol`] and calls it with the
//! current thread state, writing Python-style tracebacks for every live
//! thread straight into the given file descriptor.
//!
//! Grounded on `py_stack.cpp`'s `dump_threads`.

use std::os::raw::c_int;

use pyo3::ffi as py;

type DumpTracebackThreadsFn =
    unsafe extern "C" fn(c_int, *mut py::PyInterpreterState, *mut py::PyThreadState) -> *const libc::c_char;

/// Calls `_Py_DumpTracebackThreads(fd, NULL, current_thread_state)`, the
/// same signature and NULL-interpreter-state argument the original passes.
///
/// # Safety
/// `addr` must be the resolved, in-process address of a symbol with
/// exactly this signature (the runtime's `_Py_DumpTracebackThreads`).
pub unsafe fn dump_threads(fd: c_int, addr: u64) {
    let f: DumpTracebackThreadsFn = std::mem::transmute(addr as usize);
    let tstate = py::PyGILState_GetThisThreadState();
    f(fd, std::ptr::null_mut(), tstate);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_pointer_cast_round_trips_an_address() {
        let addr = dump_threads as usize as u64;
        let back: usize = addr as usize;
        assert_eq!(back, dump_threads as usize);
    }
}
