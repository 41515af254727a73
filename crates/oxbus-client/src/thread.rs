#[cfg(target_os = "linux")]
use libc::{SCHED_FIFO, SCHED_RR, sched_param, sched_setscheduler};
use serde::Deserialize;
use tracing::warn;

/// Scheduling policy applied at thread start. Anything other than
/// `OsDefault` requires permission (CAP_SYS_NICE); if setting the policy
/// fails, execution continues under the OS default.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SchedPolicy {
    #[default]
    OsDefault,
    Fifo,
    RoundRobin,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadPriority {
    #[default]
    OsDefault,
    Low,
    Medium,
    High,
    Custom(i32),
}

#[cfg(target_os = "linux")]
impl ThreadPriority {
    fn to_sched_param(self) -> Option<sched_param> {
        let prio = match self {
            ThreadPriority::OsDefault => return None,
            ThreadPriority::Low => 40,
            ThreadPriority::Medium => 60,
            ThreadPriority::High => 75,
            ThreadPriority::Custom(p) => p,
        };
        Some(sched_param { sched_priority: prio })
    }
}

#[cfg(target_os = "linux")]
fn set_thread_sched(policy: SchedPolicy, prio: ThreadPriority) {
    let policy = match policy {
        SchedPolicy::OsDefault => return,
        SchedPolicy::Fifo => SCHED_FIFO,
        SchedPolicy::RoundRobin => SCHED_RR,
    };
    let param = prio.to_sched_param().unwrap_or(sched_param { sched_priority: 40 });
    unsafe {
        let code = sched_setscheduler(0, policy, &param);
        if code != 0 {
            warn!(%code, ?param, "couldn't set thread scheduling policy");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_sched(policy: SchedPolicy, _prio: ThreadPriority) {
    if !matches!(policy, SchedPolicy::OsDefault) {
        warn!(?policy, "realtime scheduling only supported on linux");
    }
}

/// Called first thing by every engine thread.
pub(crate) fn thread_boot(policy: SchedPolicy, prio: ThreadPriority) {
    set_thread_sched(policy, prio);
}
