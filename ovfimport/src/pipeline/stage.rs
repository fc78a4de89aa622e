//! Named group of tasks.

/// Tasks in a stage run sequentially, in insertion order.
pub struct Stage<T> {
    pub name: &'static str,
    pub tasks: Vec<T>,
}

impl<T> Stage<T> {
    pub fn new(name: &'static str, tasks: Vec<T>) -> Self {
        Self { name, tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
