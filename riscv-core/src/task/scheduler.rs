//! Cooperative, single-host-thread scheduler over the Thread Table
//! (spec.md §4.6). Grounded in structure on
//! `examples/ryanbreen-breenix/kernel/src/task/scheduler.rs`'s ready-queue
//! plus current-thread-id bookkeeping, simplified to round-robin since
//! there is no host-side preemption to race against.

use log::{debug, trace};

use crate::cpu::registers::{FprFile, Gpr};
use crate::cpu::Cpu;
use crate::error::{Result, RiscvError};
use crate::task::thread::{SavedContext, Thread, ThreadState};

pub struct Scheduler {
    threads: Vec<Thread>,
    current: usize,
    next_tid: u64,
}

impl Scheduler {
    /// Seed the table with the initial (main) thread, tid 1, at `entry_pc`
    /// running on `stack_top`.
    pub fn new(entry_pc: u64, stack_top: u64) -> Self {
        let main = Thread::new(
            1,
            SavedContext { gpr: Gpr::new(), fpr: FprFile::new(), pc: entry_pc },
            stack_top,
            0,
        );
        let mut sched = Scheduler { threads: vec![main], current: 0, next_tid: 2 };
        sched.threads[0].state = ThreadState::Running;
        sched
    }

    pub fn current_tid(&self) -> u64 {
        self.threads[self.current].tid
    }

    fn index_of(&self, tid: u64) -> Option<usize> {
        self.threads.iter().position(|t| t.tid == tid)
    }

    /// Create a new thread (the `clone`-equivalent collaborator in §4.6).
    /// Returns the new tid.
    pub fn spawn(&mut self, pc: u64, stack_base: u64, tls_pointer: u64, child_tid_addr: u64) -> u64 {
        let tid = self.next_tid;
        self.next_tid += 1;
        let thread = Thread::new(tid, SavedContext { gpr: Gpr::new(), fpr: FprFile::new(), pc }, stack_base, tls_pointer);
        let mut thread = thread;
        thread.child_tid_addr = child_tid_addr;
        self.threads.push(thread);
        debug!("spawned thread {tid}");
        tid
    }

    pub fn save_current(&mut self, cpu: &Cpu) {
        let idx = self.current;
        self.threads[idx].saved = SavedContext { gpr: cpu.gpr.clone(), fpr: cpu.fpr.clone(), pc: cpu.pc };
    }

    pub fn restore_into(&self, cpu: &mut Cpu) {
        let t = &self.threads[self.current];
        cpu.gpr = t.saved.gpr.clone();
        cpu.fpr = t.saved.fpr.clone();
        cpu.pc = t.saved.pc;
    }

    /// A suspension point: save `cpu` into the current thread, pick the
    /// next ready thread round-robin, and restore its context into `cpu`.
    /// Raises `DEADLOCK_REACHED` if no thread is runnable.
    pub fn yield_to_next(&mut self, cpu: &mut Cpu) -> Result<()> {
        self.save_current(cpu);
        if self.threads[self.current].state == ThreadState::Running {
            self.threads[self.current].state = ThreadState::Ready;
        }
        let n = self.threads.len();
        for step in 1..=n {
            let idx = (self.current + step) % n;
            if self.threads[idx].state == ThreadState::Ready {
                self.current = idx;
                self.threads[idx].state = ThreadState::Running;
                self.restore_into(cpu);
                trace!("scheduler switched to tid {}", self.threads[idx].tid);
                return Ok(());
            }
        }
        Err(RiscvError::DeadlockReached)
    }

    pub fn exit_current(&mut self, cpu: &mut Cpu) -> Result<()> {
        self.threads[self.current].state = ThreadState::Exited;
        if self.threads.iter().all(|t| t.state == ThreadState::Exited) {
            return Ok(());
        }
        self.yield_to_next(cpu)
    }

    pub fn block_current_on(&mut self, key: u64, cpu: &mut Cpu) -> Result<()> {
        self.threads[self.current].futex_key = Some(key);
        self.threads[self.current].state = ThreadState::Blocked;
        self.yield_to_next(cpu)
    }

    /// Move up to `n` threads blocked on `key` into the ready state.
    /// Returns how many were woken.
    pub fn wake(&mut self, key: u64, n: u32) -> u32 {
        let mut woken = 0;
        for t in &mut self.threads {
            if woken >= n {
                break;
            }
            if t.state == ThreadState::Blocked && t.futex_key == Some(key) {
                t.state = ThreadState::Ready;
                t.futex_key = None;
                woken += 1;
            }
        }
        woken
    }

    pub fn thread(&self, tid: u64) -> Option<&Thread> {
        self.index_of(tid).map(|i| &self.threads[i])
    }

    pub fn thread_mut(&mut self, tid: u64) -> Option<&mut Thread> {
        self.index_of(tid).map(move |i| &mut self.threads[i])
    }

    pub fn all_exited(&self) -> bool {
        self.threads.iter().all(|t| t.state == ThreadState::Exited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_yield_is_deadlock() {
        let mut sched = Scheduler::new(0x1000, 0x2000);
        let mut cpu = Cpu::new(crate::xlen::Xlen::Rv64);
        assert!(matches!(sched.yield_to_next(&mut cpu), Err(RiscvError::DeadlockReached)));
    }

    #[test]
    fn spawned_thread_is_scheduled_round_robin() {
        let mut sched = Scheduler::new(0x1000, 0x2000);
        sched.spawn(0x2000, 0x3000, 0, 0);
        let mut cpu = Cpu::new(crate::xlen::Xlen::Rv64);
        sched.yield_to_next(&mut cpu).unwrap();
        assert_eq!(sched.current_tid(), 2);
        assert_eq!(cpu.pc, 0x2000);
    }

    #[test]
    fn wake_moves_blocked_thread_to_ready() {
        let mut sched = Scheduler::new(0x1000, 0x2000);
        sched.spawn(0x2000, 0x3000, 0, 0);
        let mut cpu = Cpu::new(crate::xlen::Xlen::Rv64);
        sched.block_current_on(0xF00, &mut cpu).unwrap(); // tid 1 blocks, tid 2 runs
        assert_eq!(sched.wake(0xF00, 1), 1);
        assert_eq!(sched.thread(1).unwrap().state, ThreadState::Ready);
    }
}
