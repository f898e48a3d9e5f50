//! Optional worker pool: one job per guest vCPU, each a full `Machine`
//! running on its own `std::thread`, sharing read-only pages across
//! siblings with strictly no cross-vCPU page mutation (spec.md §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{error, info};

use crate::machine::Machine;

/// Coordinates N independent `Machine`s. Each is forked from a seed machine
/// so they share the read-only area and execute segments by the same
/// `fork_share` path `Machine::fork` uses; callers supply the per-vCPU work
/// as a closure run on the pool worker.
pub struct VcpuPool {
    failures: Arc<Vec<AtomicBool>>,
}

impl VcpuPool {
    /// Spawn `seed.fork()`-derived vCPUs, run `job` on each, and join.
    /// `job` receives the vCPU index and its private `Machine`.
    pub fn run<F>(seed: &mut Machine, count: usize, job: F) -> VcpuPool
    where
        F: Fn(usize, &mut Machine) + Send + Sync + 'static,
    {
        let failures = Arc::new((0..count).map(|_| AtomicBool::new(false)).collect::<Vec<_>>());
        let job = Arc::new(job);
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let mut vcpu = seed.fork();
            let failures = failures.clone();
            let job = job.clone();
            handles.push(thread::spawn(move || {
                info!("vcpu {i} starting");
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(i, &mut vcpu)));
                if result.is_err() {
                    error!("vcpu {i} panicked");
                    failures[i].store(true, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        VcpuPool { failures }
    }

    pub fn failures(&self) -> &[AtomicBool] {
        &self.failures
    }

    pub fn any_failed(&self) -> bool {
        self.failures.iter().any(|f| f.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::MachineOptions;

    fn tiny_elf() -> Vec<u8> {
        // A single ecall at the entry point; enough to construct a Machine.
        let mut elf = vec![0u8; 64 + 56 + 4];
        elf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        elf[4] = 2;
        elf[5] = 1;
        elf[6] = 1;
        elf[16..18].copy_from_slice(&2u16.to_le_bytes());
        elf[18..20].copy_from_slice(&243u16.to_le_bytes());
        elf[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        elf[32..40].copy_from_slice(&64u64.to_le_bytes());
        elf[54..56].copy_from_slice(&56u16.to_le_bytes());
        elf[56..58].copy_from_slice(&1u16.to_le_bytes());
        let phdr_off = 64;
        elf[phdr_off..phdr_off + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf[phdr_off + 4..phdr_off + 8].copy_from_slice(&(4u32 | 1u32).to_le_bytes()); // R|X
        let file_off = (phdr_off + 56) as u64;
        elf[phdr_off + 8..phdr_off + 16].copy_from_slice(&file_off.to_le_bytes());
        elf[phdr_off + 16..phdr_off + 24].copy_from_slice(&0x1000u64.to_le_bytes());
        elf[phdr_off + 32..phdr_off + 40].copy_from_slice(&4u64.to_le_bytes());
        elf[phdr_off + 40..phdr_off + 48].copy_from_slice(&4u64.to_le_bytes());
        elf[120..124].copy_from_slice(&0x0000_0073u32.to_le_bytes());
        elf
    }

    #[test]
    fn pool_runs_independent_forks_without_cross_talk() {
        let mut seed = Machine::new(tiny_elf(), MachineOptions::default()).unwrap();
        let pool = VcpuPool::run(&mut seed, 4, |i, m| {
            m.set_result(i as u64);
        });
        assert!(!pool.any_failed());
    }
}
