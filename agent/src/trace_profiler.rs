//! A5: async-aware call-tree profiler. Installed via `PyEval_SetProfile`,
//! this builds a tree of frame activations and keeps only the ones worth
//! reporting — either by wall-clock cost or by call depth, and either
//! blind to coroutine suspension or aware of it.
//!
//! Grounded on `trace_profile.c`'s `TraceProfiler`/`FrameNode`. The original
//! hand-rolls four near-identical `PyEval_SetProfile` callbacks
//! (`profile`, `profile_with_depth`, `async_profile`,
//! `async_profile_with_depth`) selected at `set_trace_profile` time; this
//! keeps one [`TraceProfiler`] whose `is_async` and `depth_limit` fields
//! pick the same four behaviors out of shared code, since the branching is
//! identical modulo which threshold gates a frame's survival.

use std::cell::RefCell;
use std::rc::Rc;

use flight_profiler_common::grammar::{FrameHeader, FramePayload};

/// Mirrors `sys.setprofile`'s `what` codes the original switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileEvent {
    Call,
    Return,
    CCall,
    CReturn,
    CException,
}

/// What's needed to build a frame's payload, read off the real frame/code
/// object by the caller (via `pyffi`) at return time — the profiler itself
/// never touches CPython structures.
pub struct NativeFrameDescriptor {
    pub name: String,
    pub origin: String,
    pub linenum: u32,
}

struct FrameNode {
    parent: Option<Rc<RefCell<FrameNode>>>,
    children: Vec<Rc<RefCell<FrameNode>>>,
    start_ns: u64,
    offset: i64,
    header: Option<FrameHeader>,
    frame_id: Option<usize>,
    /// Async frames only: alternating enter/leave timestamps across
    /// however many times this coroutine has been resumed.
    enter_timestamps: Vec<u64>,
}

impl FrameNode {
    fn new(offset: i64) -> Rc<RefCell<FrameNode>> {
        Rc::new(RefCell::new(FrameNode {
            parent: None,
            children: Vec::new(),
            start_ns: 0,
            offset,
            header: None,
            frame_id: None,
            enter_timestamps: Vec::new(),
        }))
    }
}

const SENTINEL_OFFSET: i64 = -1;

pub struct TraceProfiler {
    top: Rc<RefCell<FrameNode>>,
    sz: i64,
    sf_sz: i64,
    is_async: bool,
    interval_ns: u64,
    current_depth: i64,
    depth_limit: i64,
    send_buffer: Vec<Option<FramePayload>>,
}

impl TraceProfiler {
    /// `depth_limit <= 0` selects cost-threshold mode; otherwise a frame
    /// survives by depth instead of by cost, the same switch
    /// `set_trace_profile` makes when picking a callback.
    pub fn new(interval_ns: u64, is_async: bool, depth_limit: i64) -> Self {
        TraceProfiler {
            top: FrameNode::new(SENTINEL_OFFSET),
            sz: 1,
            sf_sz: 0,
            is_async,
            interval_ns,
            current_depth: 0,
            depth_limit,
            send_buffer: Vec::new(),
        }
    }

    fn depth_limited(&self) -> bool {
        self.depth_limit > 0
    }

    /// Whether this profiler was installed against the async-aware entry
    /// points, the flag `set_trace_profile` uses to pick a callback family.
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    fn set_send_slot(&mut self, offset: i64, payload: FramePayload) {
        debug_assert!(offset >= 0);
        let idx = offset as usize;
        while self.send_buffer.len() <= idx {
            self.send_buffer.push(None);
        }
        self.send_buffer[idx] = Some(payload);
    }

    fn push_frame(&mut self, start_ns: u64) {
        let node = FrameNode::new(self.sf_sz);
        {
            let mut n = node.borrow_mut();
            n.start_ns = start_ns;
            n.parent = Some(self.top.clone());
        }
        self.sz += 1;
        self.sf_sz += 1;
        if self.depth_limited() {
            self.current_depth += 1;
        }
        self.top = node;
    }

    fn pop_frame(&mut self) -> Rc<RefCell<FrameNode>> {
        let popped = self.top.clone();
        let parent = popped
            .borrow()
            .parent
            .clone()
            .expect("popped past the sentinel root");
        self.top = parent;
        self.sz -= 1;
        if self.depth_limited() {
            self.current_depth -= 1;
        }
        popped
    }

    fn inner_push_async_frame(&mut self, start_ns: u64, header: FrameHeader, frame_id: usize) {
        let node = FrameNode::new(self.sf_sz);
        {
            let mut n = node.borrow_mut();
            n.enter_timestamps.push(start_ns);
            n.frame_id = Some(frame_id);
            n.header = Some(header);
            n.start_ns = start_ns;
            n.parent = Some(self.top.clone());
        }
        self.top.borrow_mut().children.push(node.clone());
        self.sz += 1;
        self.sf_sz += 1;
        if self.depth_limited() {
            self.current_depth += 1;
        }
        self.top = node;
    }

    /// Survival test shared by every "is this accumulated cost worth
    /// keeping" decision point: by depth if depth-limited, by cost
    /// otherwise.
    fn survives(&self, cost_ns: u64) -> bool {
        if self.depth_limited() {
            self.current_depth < self.depth_limit
        } else {
            cost_ns >= self.interval_ns
        }
    }

    /// Closes whatever async frame is the last child of `top`, emitting it
    /// if it survives, discarding the reserved send slot otherwise.
    fn finish_unclosed_async_frame(&mut self) {
        let last_child = {
            let top = self.top.borrow();
            top.children.last().cloned()
        };
        let Some(child) = last_child else { return };
        self.top.borrow_mut().children.pop();

        let (first_enter, last_leave, offset, header) = {
            let c = child.borrow();
            let first = *c.enter_timestamps.first().unwrap_or(&c.start_ns);
            let last = *c.enter_timestamps.last().unwrap_or(&c.start_ns);
            (first, last, c.offset, c.header.clone())
        };
        let cost_ns = last_leave.saturating_sub(first_enter);

        if self.survives(cost_ns) {
            let parent_offset = self.top.borrow().offset;
            if let Some(header) = header {
                let payload = FramePayload::finished_async(&header, first_enter, cost_ns, parent_offset);
                self.set_send_slot(offset, payload);
            }
        } else {
            self.sf_sz -= 1;
        }
    }

    /// Entry point for `call`/`c_call` on a non-async profiler.
    pub fn on_call(&mut self, now_ns: u64) {
        self.push_frame(now_ns);
    }

    /// Entry point for `return`/`c_return`/`c_exception` on a non-async
    /// profiler.
    pub fn on_return(&mut self, now_ns: u64, descriptor: NativeFrameDescriptor) {
        let node = self.pop_frame();
        let start_ns = node.borrow().start_ns;
        let offset = node.borrow().offset;
        let cost_ns = now_ns.saturating_sub(start_ns);

        if !self.survives(cost_ns) {
            self.sf_sz -= 1;
            return;
        }
        let parent_offset = self.top.borrow().offset;
        let payload = FramePayload::normal(
            &descriptor.name,
            &descriptor.origin,
            descriptor.linenum,
            start_ns,
            cost_ns,
            parent_offset,
        );
        self.set_send_slot(offset, payload);
    }

    /// Entry point for `call`/`c_call` on an async-aware profiler.
    /// `frame_id` is the frame object's identity (its address, cast to
    /// `usize`); `is_async_frame` comes from the code object's
    /// `CO_COROUTINE` flag.
    pub fn on_call_async(
        &mut self,
        now_ns: u64,
        header: FrameHeader,
        is_async_frame: bool,
        frame_id: usize,
    ) {
        if !is_async_frame {
            if self.top.borrow().offset == SENTINEL_OFFSET {
                return;
            }
            self.finish_unclosed_async_frame();
            self.push_frame(now_ns);
            return;
        }

        if self.top.borrow().offset == SENTINEL_OFFSET {
            let last_child = self.top.borrow().children.last().cloned();
            match last_child {
                Some(child) if child.borrow().frame_id == Some(frame_id) => {
                    self.top = child;
                }
                Some(_) => return,
                None => {
                    self.inner_push_async_frame(now_ns, header, frame_id);
                    return;
                }
            }
        }

        let same_coroutine = self.top.borrow().frame_id == Some(frame_id);
        if same_coroutine {
            let has_children = !self.top.borrow().children.is_empty();
            if !has_children {
                let last_leave = *self.top.borrow().enter_timestamps.last().unwrap();
                let cost_ns = now_ns.saturating_sub(last_leave);
                if self.survives(cost_ns) {
                    let parent_offset = self.top.borrow().offset;
                    let payload = FramePayload::await_switch(last_leave, cost_ns, parent_offset);
                    self.set_send_slot(self.sf_sz, payload);
                    self.sf_sz += 1;
                }
                self.top.borrow_mut().enter_timestamps.pop();
            } else {
                let next = self.top.borrow().children.last().cloned().unwrap();
                self.top = next;
            }
        } else {
            self.finish_unclosed_async_frame();
            self.inner_push_async_frame(now_ns, header, frame_id);
        }
    }

    /// Entry point for `return`/`c_return`/`c_exception` on an async-aware
    /// profiler.
    pub fn on_return_async(
        &mut self,
        now_ns: u64,
        descriptor: NativeFrameDescriptor,
        is_async_frame: bool,
    ) {
        if self.top.borrow().offset == SENTINEL_OFFSET {
            return;
        }
        if !is_async_frame {
            let node = self.pop_frame();
            let start_ns = node.borrow().start_ns;
            let offset = node.borrow().offset;
            let cost_ns = now_ns.saturating_sub(start_ns);
            if !self.survives(cost_ns) {
                self.sf_sz -= 1;
                return;
            }
            let parent_offset = self.top.borrow().offset;
            let payload = FramePayload::normal(
                &descriptor.name,
                &descriptor.origin,
                descriptor.linenum,
                start_ns,
                cost_ns,
                parent_offset,
            );
            self.set_send_slot(offset, payload);
        } else {
            self.top.borrow_mut().enter_timestamps.push(now_ns);
            let parent = self.top.borrow().parent.clone();
            if let Some(parent) = parent {
                self.top = parent;
            }
        }
    }

    /// Walks from the current top upward, emitting every still-open async
    /// frame whose accumulated wall-clock survives, the way
    /// `remove_trace_profile` drains whatever coroutine chain was
    /// in-flight when profiling stopped.
    fn fulfill_async_unfinished_requests(&mut self) {
        loop {
            let is_sentinel = self.top.borrow().offset == SENTINEL_OFFSET;
            if is_sentinel {
                let last_child = self.top.borrow().children.last().cloned();
                match last_child {
                    Some(child) => {
                        self.top.borrow_mut().children.pop();
                        if self.depth_limited() {
                            self.current_depth += 1;
                        }
                        self.top = child;
                    }
                    None => return,
                }
                continue;
            }

            let (first_enter, last_leave, offset, header) = {
                let node = self.top.borrow();
                let first = *node.enter_timestamps.first().unwrap_or(&node.start_ns);
                let last = *node.enter_timestamps.last().unwrap_or(&node.start_ns);
                (first, last, node.offset, node.header.clone())
            };
            let cost_ns = last_leave.saturating_sub(first_enter);
            if !self.survives(cost_ns) {
                return;
            }

            let parent_offset = self
                .top
                .borrow()
                .parent
                .as_ref()
                .map(|p| p.borrow().offset)
                .unwrap_or(SENTINEL_OFFSET);
            if let Some(header) = header {
                let payload = FramePayload::finished_async(&header, first_enter, cost_ns, parent_offset);
                self.set_send_slot(offset, payload);
            }

            let last_child = self.top.borrow().children.last().cloned();
            match last_child {
                Some(child) => {
                    self.top.borrow_mut().children.pop();
                    if self.depth_limited() {
                        self.current_depth += 1;
                    }
                    self.top = child;
                }
                None => return,
            }
        }
    }

    /// Drains the send buffer, finishing any still-open async chain first.
    /// The caller (bootstrap/pyffi) is responsible for handing the result
    /// to the controller-supplied target callable under the runtime lock.
    pub fn finish(mut self) -> Vec<Option<FramePayload>> {
        if self.is_async {
            self.fulfill_async_unfinished_requests();
        }
        self.send_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> NativeFrameDescriptor {
        NativeFrameDescriptor {
            name: name.to_string(),
            origin: "test.py".to_string(),
            linenum: 1,
        }
    }

    #[test]
    fn sync_frame_under_cost_threshold_is_dropped() {
        let mut tp = TraceProfiler::new(1_000, false, 0);
        tp.on_call(0);
        tp.on_return(500, descriptor("fast"));
        let frames = tp.finish();
        assert!(frames.is_empty());
    }

    #[test]
    fn sync_frame_over_cost_threshold_is_kept() {
        let mut tp = TraceProfiler::new(1_000, false, 0);
        tp.on_call(0);
        tp.on_return(5_000, descriptor("slow"));
        let frames = tp.finish();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_some());
    }

    #[test]
    fn depth_limited_profiler_keeps_shallow_frames_regardless_of_cost() {
        let mut tp = TraceProfiler::new(1_000_000, false, 2);
        tp.on_call(0);
        tp.on_return(1, descriptor("shallow"));
        let frames = tp.finish();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_some());
    }

    #[test]
    fn nested_sync_frames_reserve_parent_and_child_slots() {
        let mut tp = TraceProfiler::new(0, false, 0);
        tp.on_call(0);
        tp.on_call(1);
        tp.on_return(2, descriptor("child"));
        tp.on_return(3, descriptor("parent"));
        let frames = tp.finish();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_some());
        assert!(frames[1].is_some());
    }

    #[test]
    fn async_await_gap_over_threshold_emits_synthetic_frame() {
        let mut tp = TraceProfiler::new(100, true, 0);
        let header = FrameHeader::new("coro", "app.py", 10);
        tp.on_call_async(0, header.clone(), true, 42);
        tp.on_return_async(10, descriptor("coro"), true);
        tp.on_call_async(1_000, header, true, 42);
        tp.on_return_async(1_010, descriptor("coro"), true);
        let frames = tp.finish();
        assert!(frames.iter().any(|f| f.is_some()));
    }
}
