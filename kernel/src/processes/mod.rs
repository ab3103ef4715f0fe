pub mod loader;

/// Process identifier, as handed out by the process table
pub type Pid = u32;
