use log::{info, warn};

/// Lowest and highest FIFO priority handed out to readout threads. Kept well
/// below the kernel's own RT threads.
pub const MIN_RT_PRIORITY: i32 = 1;
pub const MAX_RT_PRIORITY: i32 = 49;

/// What actually took effect for a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadSetup {
    pub pinned: bool,
    pub realtime: bool,
}

/// Pin the calling thread to `core` and ask for SCHED_FIFO at `priority`.
/// Failures are logged and otherwise ignored.
pub fn configure_current_thread(name: &str, core: Option<usize>, priority: Option<i32>) -> ThreadSetup {
    let mut setup = ThreadSetup::default();
    if let Some(core) = core {
        match pin_to_core(core) {
            Ok(()) => {
                info!("{name} thread pinned to core {core}");
                setup.pinned = true;
            }
            Err(e) => warn!("Could not pin {name} thread to core {core}: {e}"),
        }
    }
    if let Some(priority) = priority {
        let priority = priority.clamp(MIN_RT_PRIORITY, MAX_RT_PRIORITY);
        match set_fifo_priority(priority) {
            Ok(()) => {
                info!("{name} thread running SCHED_FIFO priority {priority}");
                setup.realtime = true;
            }
            Err(e) => warn!("Could not set {name} thread to SCHED_FIFO {priority}: {e}"),
        }
    }
    setup
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) -> std::io::Result<()> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    }
    // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut cpuset);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_fifo_priority(priority: i32) -> std::io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 is the calling thread and param outlives the call.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

#[cfg(not(target_os = "linux"))]
fn set_fifo_priority(_priority: i32) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}
