pub mod job_store;
pub mod json_repair;
pub mod llm_client;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod redis_store;
pub mod response_parser;
