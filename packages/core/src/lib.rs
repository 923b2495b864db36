#![doc = include_str!("../README.md")]

pub(crate) mod arena;
pub(crate) mod error;
pub(crate) mod host;
pub(crate) mod map;
pub(crate) mod observer;
pub(crate) mod reconcile;
pub(crate) mod runtime;
pub(crate) mod scheduler;
pub(crate) mod scope;
pub(crate) mod selector;
pub(crate) mod source;
pub(crate) mod subscription;
pub(crate) mod suspense;
pub(crate) mod tasks;

pub use crate::arena::{ObserverId, SourceId};
pub use crate::error::{ReactiveError, Suspended};
pub use crate::host::{FrameHandle, HostClock, ManualClock, TimerHandle};
pub use crate::map::{map_indexed, map_keyed, MapOptions, DEFAULT_POOL_LIMIT};
pub use crate::observer::{
    batch, create_after_effect, create_computed, create_computed_with, create_memo,
    create_memo_with, create_observer, create_render_effect, is_tracking, untrack, Computed, Memo,
};
pub use crate::reconcile::{reconcile, NodeOp, Recorder, VecTree, WriteNodes};
pub use crate::runtime::{enter_fresh_runtime, set_host_clock, RuntimeGuard};
pub use crate::scheduler::current_tick;
pub use crate::scope::{
    create_app_root, create_context_key, create_remountable_root, create_root, current_owner,
    on_cleanup, on_error, on_mount, provide_context, remount, throw_error, unmount, use_context,
    ContextKey, Disposer, Owner,
};
pub use crate::selector::{create_selector, create_selector_with, watch, Selector};
pub use crate::source::{
    create_signal, create_signal_pair, create_signal_with, Equality, ReadSignal, Signal,
    WriteSignal,
};
pub use crate::subscription::check_subscription_bijection;
pub use crate::suspense::{create_suspense, suspend, suspend_result, Suspense};
pub use crate::tasks::{
    action, await_task, create_task, suspended_task, task_effect, task_observer,
    task_render_effect, Action, Defer, Produced, TaskHandle, TaskSource, TaskValue,
};

pub mod prelude {
    //! The working set most programs import wholesale.
    pub use crate::observer::{
        batch, create_after_effect, create_computed, create_memo, create_observer,
        create_render_effect, untrack, Computed, Memo,
    };
    pub use crate::reconcile::{reconcile, WriteNodes};
    pub use crate::scope::{create_root, on_cleanup, on_error, on_mount, provide_context, use_context};
    pub use crate::selector::{create_selector, watch};
    pub use crate::source::{create_signal, create_signal_pair, Equality, Signal};
    pub use crate::suspense::{create_suspense, suspend};
    pub use crate::tasks::{action, await_task, create_task, Action, TaskSource, TaskValue};
}
