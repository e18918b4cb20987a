use std::{mem, process::Child};
use tokio::runtime::Handle;
use tracing::debug;

/// Handle for one or more child processes which ensures they are properly
/// closed on drop.
///
/// Where processes are chained, the *last* process in the `Vec` is the one
/// whose stdout feeds the session.
#[derive(Debug, Default)]
pub struct ChildContainer(Vec<Child>);

impl ChildContainer {
    /// Wraps a set of running children for scoped cleanup.
    #[must_use]
    pub fn new(children: Vec<Child>) -> Self {
        Self(children)
    }
}

impl From<Child> for ChildContainer {
    fn from(child: Child) -> Self {
        Self(vec![child])
    }
}

impl Drop for ChildContainer {
    fn drop(&mut self) {
        let children = mem::take(&mut self.0);

        if let Ok(handle) = Handle::try_current() {
            handle.spawn_blocking(move || {
                cleanup_child_processes(children);
            });
        } else {
            cleanup_child_processes(children);
        }
    }
}

fn cleanup_child_processes(mut children: Vec<Child>) {
    let attempt = if let Some(child) = children.last_mut() {
        child.kill()
    } else {
        return;
    };

    let attempt = attempt.and_then(|()| {
        children
            .iter_mut()
            .rev()
            .try_for_each(|child| child.wait().map(|_| ()))
    });

    if let Err(e) = attempt {
        debug!("Error awaiting child process: {:?}", e);
    }
}
