/// Suspend the current task and resume it on a worker thread.
///
/// Forms, mirroring [`suspend`](crate::suspend):
/// - `suspend!()` — default scheduler, any CPU, low priority
/// - `suspend!(scheduler)`
/// - `suspend!(scheduler, affinity)`
/// - `suspend!(scheduler, affinity, priority)` — raw priorities clamp
#[macro_export]
macro_rules! suspend {
    () => {
        $crate::suspend(&$crate::Scheduler::instance(), 0, $crate::Priority::Low).await
    };
    ($scheduler:expr) => {
        $crate::suspend($scheduler, 0, $crate::Priority::Low).await
    };
    ($scheduler:expr, $affinity:expr) => {
        $crate::suspend($scheduler, $affinity, $crate::Priority::Low).await
    };
    ($scheduler:expr, $affinity:expr, $priority:expr) => {
        $crate::suspend($scheduler, $affinity, $crate::Priority::from_raw($priority)).await
    };
}
