/// The closed set of worker thread kinds. `Control` may not be used as a
/// [`crate::thread::BackgroundThread`]'s type: the control thread is the
/// controller's single writer and is driven directly, not as a background
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadType {
    Control,
    Inference,
    Training,
}

impl ThreadType {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadType::Control => "control",
            ThreadType::Inference => "inference",
            ThreadType::Training => "training",
        }
    }
}

impl std::fmt::Display for ThreadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
