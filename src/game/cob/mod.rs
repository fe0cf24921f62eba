//! The per-unit script virtual machine.
//!
//! Each unit owns a `CobEnvironment`: statics, threads and the scheduling
//! queues. Threads are plain structs advanced by an explicit dispatcher;
//! within a tick a unit's ready queue is drained in FIFO order and a thread
//! runs until it blocks on one of the three waiting opcodes, returns from its
//! outermost frame, or is killed by a signal.

pub mod context;
pub mod script;

pub use context::run_cob_query;
pub use context::run_unit_cob_scripts;
pub use script::{CobFunction, CobScript, CobValueId, OpCode};

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::game::unit_mesh::SimAxis;
use crate::game::GameTime;

/// The condition a blocked thread is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedStatus {
    Move { piece: usize, axis: SimAxis },
    Turn { piece: usize, axis: SimAxis },
}

/// Why a thread stopped executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Finished,
    Blocked(BlockedStatus),
    Sleeping(GameTime),
}

#[derive(Clone, Debug)]
pub struct CobFrame {
    pub instruction_index: usize,
    pub locals: SmallVec<[i32; 8]>,
    pub local_count: usize,
}

impl CobFrame {
    pub fn new(address: usize, params: Vec<i32>) -> Self {
        let local_count = params.len();
        Self {
            instruction_index: address,
            locals: SmallVec::from_vec(params),
            local_count,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CobThread {
    pub name: String,
    pub signal_mask: u32,
    pub call_stack: Vec<CobFrame>,
    pub stack: SmallVec<[i32; 16]>,
    pub return_value: i32,
    /// Locals of the last returned frame, read by synchronous queries for
    /// out-parameters.
    pub return_locals: SmallVec<[i32; 8]>,
}

impl CobThread {
    pub fn new(name: String, address: usize, params: Vec<i32>, signal_mask: u32) -> Self {
        Self {
            name,
            signal_mask,
            call_stack: vec![CobFrame::new(address, params)],
            stack: SmallVec::new(),
            return_value: 0,
            return_locals: SmallVec::new(),
        }
    }
}

/// A unit's script execution environment.
pub struct CobEnvironment {
    pub script: Arc<CobScript>,
    pub statics: Vec<i32>,
    /// Thread slots; a `None` marks a killed or reaped thread. Indices are
    /// stable for a thread's whole lifetime.
    pub threads: Vec<Option<CobThread>>,
    pub ready_queue: VecDeque<usize>,
    pub blocked_queue: Vec<(BlockedStatus, usize)>,
    pub sleeping_queue: Vec<(GameTime, usize)>,
    pub finished_queue: Vec<usize>,
}

impl Default for CobEnvironment {
    fn default() -> Self {
        Self::new(Arc::new(CobScript::default()))
    }
}

impl CobEnvironment {
    pub fn new(script: Arc<CobScript>) -> Self {
        Self {
            script,
            statics: Vec::new(),
            threads: Vec::new(),
            ready_queue: VecDeque::new(),
            blocked_queue: Vec::new(),
            sleeping_queue: Vec::new(),
            finished_queue: Vec::new(),
        }
    }

    pub fn get_static(&self, id: usize) -> i32 {
        self.statics.get(id).copied().unwrap_or(0)
    }

    pub fn set_static(&mut self, id: usize, value: i32) {
        if id >= self.statics.len() {
            self.statics.resize(id + 1, 0);
        }
        self.statics[id] = value;
    }

    /// Starts a scheduled thread for the named script function, if the script
    /// exports one. Missing functions are tolerated: units routinely lack
    /// optional callbacks like `StartMoving`.
    pub fn create_thread(&mut self, name: &str, params: Vec<i32>) -> Option<usize> {
        self.create_thread_with_mask(name, params, 0)
    }

    pub fn create_thread_with_mask(
        &mut self,
        name: &str,
        params: Vec<i32>,
        signal_mask: u32,
    ) -> Option<usize> {
        let function_id = self.script.find_function(name)?;
        Some(self.create_thread_by_id(function_id, params, signal_mask))
    }

    pub fn create_thread_by_id(
        &mut self,
        function_id: usize,
        params: Vec<i32>,
        signal_mask: u32,
    ) -> usize {
        let function = &self.script.functions[function_id];
        let thread = CobThread::new(function.name.clone(), function.address, params, signal_mask);
        let index = self.threads.len();
        self.threads.push(Some(thread));
        self.ready_queue.push_back(index);
        index
    }

    /// Creates a thread that is not entered into any scheduling structure.
    /// Used for synchronous queries, which must run to completion immediately.
    pub fn create_non_scheduled_thread(&self, name: &str, params: Vec<i32>) -> Option<CobThread> {
        let function_id = self.script.find_function(name)?;
        let function = &self.script.functions[function_id];
        Some(CobThread::new(
            function.name.clone(),
            function.address,
            params,
            0,
        ))
    }

    /// Kills every live thread whose signal mask matches `signal`, other than
    /// `sender`. Killed threads are removed from all scheduling structures.
    pub fn send_signal(&mut self, signal: u32, sender: Option<usize>) {
        for index in 0..self.threads.len() {
            if Some(index) == sender {
                continue;
            }
            let matches = match &self.threads[index] {
                Some(t) => t.signal_mask & signal != 0,
                None => false,
            };
            if matches {
                self.kill_thread(index);
            }
        }
    }

    fn kill_thread(&mut self, index: usize) {
        self.threads[index] = None;
        self.ready_queue.retain(|&i| i != index);
        self.blocked_queue.retain(|&(_, i)| i != index);
        self.sleeping_queue.retain(|&(_, i)| i != index);
        self.finished_queue.retain(|&i| i != index);
    }

    /// Collects the result of a finished thread.
    ///
    /// Returns `None` while the thread is still running. A thread that was
    /// killed by a signal reaps as 0, so pollers treat it as a failed run.
    pub fn try_reap_thread(&mut self, index: usize) -> Option<i32> {
        if let Some(pos) = self.finished_queue.iter().position(|&i| i == index) {
            self.finished_queue.remove(pos);
            let value = self.threads[index].as_ref().map(|t| t.return_value);
            self.threads[index] = None;
            return value.or(Some(0));
        }
        if self.threads.get(index).is_some_and(|t| t.is_none()) {
            return Some(0);
        }
        None
    }

    pub fn live_thread_count(&self) -> usize {
        self.threads.iter().filter(|t| t.is_some()).count()
    }
}
