pub mod job;
pub mod llm;
pub mod report;
