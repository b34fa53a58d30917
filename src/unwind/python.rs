//! Walking the CPython interpreter frame list.
//!
//! Interpreter frames form a singly linked list through
//! `_PyInterpreterFrame.previous`, innermost frame first. Each frame is
//! resolved to its source position while it is still live; by the time
//! a profile is built the interpreter has moved on.

use std::sync::Arc;

use log::debug;

use crate::domain::Ptr32;
use crate::guest::MemoryView;
use crate::listener::{Frame, FunctionIdent, SourceHint};
use crate::symbolization::python::{PyError, PyRuntime};

pub struct PyStackWalker<'a> {
    runtime: &'a PyRuntime,
    mem: &'a dyn MemoryView,
    module: Arc<str>,
    frame: Ptr32,
    failed: bool,
}

impl<'a> PyStackWalker<'a> {
    pub fn start(runtime: &'a PyRuntime, mem: &'a dyn MemoryView, def: &FunctionIdent) -> Self {
        let (frame, failed) = match runtime.current_frame(mem) {
            Ok(frame) => (frame, false),
            Err(err) => {
                debug!("python unwind: cannot locate current frame: {err}");
                (Ptr32::NULL, true)
            }
        };
        PyStackWalker { runtime, mem, module: def.module.clone(), frame, failed }
    }

    /// True when the walk died on a read error; the partial trace must
    /// be discarded.
    pub fn failed(&self) -> bool {
        self.failed
    }
}

impl Iterator for PyStackWalker<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.failed || self.frame.is_null() {
            return None;
        }

        let call = match self.runtime.describe_frame(self.mem, self.frame) {
            Ok(call) => call,
            Err(err) => {
                debug!("python unwind: cannot read frame {:#x}: {err}", self.frame.addr());
                self.failed = true;
                return None;
            }
        };

        match self.runtime.previous_frame(self.mem, self.frame) {
            Ok(prev) if prev == self.frame => {
                // A frame that is its own predecessor would loop
                // forever; terminate the walk.
                debug!("python unwind: frame {:#x} links to itself", prev.addr());
                self.frame = Ptr32::NULL;
            }
            Ok(prev) => self.frame = prev,
            Err(PyError::Memory(err)) => {
                debug!("python unwind: {err}; discarding trace");
                self.failed = true;
                return None;
            }
            Err(err) => {
                debug!("python unwind: {err}");
                self.frame = Ptr32::NULL;
            }
        }

        let name: Arc<str> = Arc::from(call.name.as_str());
        Some(Frame {
            function: FunctionIdent {
                module: self.module.clone(),
                name: name.clone(),
                debug_name: name,
                index: 0,
                host: false,
            },
            // Interpreter frames have no stable program counter; a
            // process-wide monotonic counter keeps stack keys distinct.
            pc: self.runtime.next_pc(),
            source: Some(SourceHint {
                file: Arc::from(call.file.as_str()),
                line: call.line,
                address: u64::from(call.addr),
            }),
        })
    }
}
