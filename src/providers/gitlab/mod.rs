mod client;
mod links;

pub use client::GitLabClient;
pub use links::PipelineLinks;
