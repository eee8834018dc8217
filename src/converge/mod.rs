//! Coordination with the in-cluster converge reconciler

mod lock;

pub use lock::{
    decide, ConvergeLockConfig, ConvergeLocker, ConvergeUnlocker, KubeConvergeLocker,
    LeaseDecision, CONVERGE_LEASE_NAME, CONVERGE_LEASE_NAMESPACE, DEFAULT_LOCK_TTL,
    DEFAULT_RENEW_INTERVAL, HELD_WITHOUT_WATCH_TTL,
};
