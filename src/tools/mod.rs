mod background;

pub use background::{CheckBackgroundTaskTool, StartBackgroundTaskTool};
