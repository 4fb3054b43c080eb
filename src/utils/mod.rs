pub(crate) mod async_task;

pub(crate) use async_task::*;

#[cfg(test)]
mod async_task_test;
