mod school;
mod tool;

pub use school::*;
pub use tool::*;
