pub mod class_layout;
pub mod classes;
pub mod control_flow;
pub mod graph;
pub mod info;
pub mod lines;
pub mod strings;
pub mod trees;
pub mod variables;

pub use graph::{DebugSection, DebugSectionGraph};
pub use info::{read_debug_info, DebugInfo, DebugInfoReader};
