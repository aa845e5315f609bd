//! Built-in tools: YAML validation and command execution.

pub mod command;
pub mod yaml;

pub use command::CommandTool;
pub use yaml::YamlValidator;
