use bevy_tasks::AsyncComputeTaskPool;
use bevy_tasks::TaskPool;

use super::Executor;
use super::Task;

/// Runs tasks on Bevy's [`AsyncComputeTaskPool`], sharing its threads with
/// the rest of a Bevy app. The pool is initialized with default settings if
/// the app has not done so.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputePoolExecutor;

impl Executor for ComputePoolExecutor {
    fn execute(&self, task: Task) {
        let task_pool = AsyncComputeTaskPool::get_or_init(TaskPool::default);
        let handle = task_pool.spawn(async move { task.run() });
        handle.detach();
    }
}
