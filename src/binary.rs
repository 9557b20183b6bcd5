pub mod code_section;
pub mod global_section;
pub mod import_section;
pub mod instruction;
pub mod module;
pub mod name_section;
pub mod opcode;
pub mod parser;
pub mod reader;
pub mod section;
pub mod source;
pub mod type_section;
pub mod types;
