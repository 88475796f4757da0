pub mod run;
pub mod targets;
