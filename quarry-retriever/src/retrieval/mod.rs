//! The two pipelines and the document sources they consume.

pub mod ingestion;
pub mod search;
pub mod sources;
