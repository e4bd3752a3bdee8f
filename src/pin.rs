//! CPU affinity pinning.
//!
//! Identical to `retina-core::multicore::pin::pin_thread_to_core`. The original
//! prototype's `worker.py` called `os.sched_setaffinity(0, {core_id})` per worker process;
//! here every worker is a thread in the same process, so `Pid::from_raw(0)` (the calling
//! thread, per `sched_setaffinity(2)`) still pins the right thread.
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use nix::Error;

pub fn pin_thread_to_core(core: u32) -> Result<(), Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core as usize)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    Ok(())
}
